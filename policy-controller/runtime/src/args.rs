use crate::{
    core::schedule::Backoff,
    dryrun,
    index::{self, Index},
    k8s, lease,
    metrics::EvaluationMetrics,
    scheduler::{self, Scheduler},
    status,
    store::KubeStore,
    watches,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, warn, Instrument};

// The maximum number of status updates to buffer. At most one update is
// produced per evaluation.
const STATUS_UPDATE_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Parser)]
#[clap(
    name = "config-policy-controller",
    about = "Evaluates and enforces ConfigurationPolicy resources"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "config_policy=info,warn",
        env = "CONFIG_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "open-cluster-management-agent-addon")]
    controller_namespace: String,

    #[clap(long, default_value = "config-policy-controller")]
    deployment_name: String,

    /// Only the replica holding the lease evaluates policies and writes
    /// statuses.
    #[clap(long)]
    leader_elect: bool,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// The maximum number of policies evaluated at once.
    #[clap(long, default_value = "2")]
    evaluation_concurrency: usize,

    /// The minimum number of seconds between watch-triggered evaluations of
    /// a policy.
    #[clap(long, default_value = "10")]
    default_evaluation_backoff: u64,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Evaluates a policy against cluster state read from YAML files.
    Dryrun(dryrun::Args),
}

impl Args {
    /// Parses arguments and runs until shutdown, returning the exit code.
    #[inline]
    pub async fn parse_and_run() -> Result<u8> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<u8> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            controller_namespace,
            deployment_name,
            leader_elect,
            patch_timeout_ms,
            evaluation_concurrency,
            default_evaluation_backoff,
            command,
        } = self;

        if let Some(Command::Dryrun(dryrun)) = command {
            log_format.try_init(log_level)?;
            return dryrun.run().await;
        }

        if evaluation_concurrency == 0 {
            bail!("--evaluation-concurrency must be at least 1");
        }

        // Policy and namespace watches feed the index, which wakes the
        // scheduler through this channel. The status controller reports the
        // outcome of each status write on it too.
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let index = Index::shared(triggers_tx.clone());

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("policy_index"), index.clone());
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("policy_status"));
        let eval_metrics = EvaluationMetrics::register(prom.sub_registry_with_prefix("policy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            warn!("HOSTNAME is not set");
            deployment_name.clone()
        });

        let leader = if leader_elect {
            lease::elect(
                runtime.client(),
                &controller_namespace,
                &deployment_name,
                &hostname,
            )
            .await?
        } else {
            info!("Leader election disabled");
            status::Leadership::always(hostname)
        };

        // Spawn resource watches.

        let policies = runtime.watch_all::<k8s::ConfigurationPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("configurationpolicies")),
        );

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let store = Arc::new(KubeStore::new(runtime.client(), index.clone()));
        let kinds = index.read().watched_kinds();
        tokio::spawn(
            watches::run(runtime.client(), store.clone(), index.clone(), kinds)
                .instrument(info_span!("objects")),
        );

        // Spawn the status controller, which writes the statuses the
        // scheduler publishes.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_controller = status::Controller::new(
            leader.clone(),
            runtime.client(),
            updates_rx,
            triggers_tx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        let scheduler = Scheduler::new(
            store,
            index,
            leader,
            updates_tx,
            scheduler::Config {
                concurrency: evaluation_concurrency,
                throttle: Duration::from_secs(default_evaluation_backoff),
                backoff: Backoff::default(),
                ..Default::default()
            },
            eval_metrics,
        );
        tokio::spawn(scheduler.run(triggers_rx).instrument(info_span!("scheduler")));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(0)
    }
}

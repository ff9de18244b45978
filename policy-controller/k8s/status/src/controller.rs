use crate::{make_event, make_patch, ComplianceEvent, ControllerMetrics, Leadership, Update};
use config_policy_controller_k8s_api::{self as k8s, ConfigurationPolicy};
use config_policy_controller_k8s_index::Trigger;
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};

/// Writes policy statuses and compliance events.
///
/// Only the replica holding the lease writes; updates received by other
/// replicas are dropped, since the leader computes its own. The outcome of
/// each write is reported back to the scheduler so that failed writes are
/// retried.
pub struct Controller {
    leader: Leadership,
    client: k8s::Client,
    updates: mpsc::Receiver<Update>,
    outcomes: mpsc::UnboundedSender<Trigger>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

impl Controller {
    pub fn new(
        leader: Leadership,
        client: k8s::Client,
        updates: mpsc::Receiver<Update>,
        outcomes: mpsc::UnboundedSender<Trigger>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            leader,
            client,
            updates,
            outcomes,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        while let Some(update) = self.updates.recv().await {
            if !self.leader.is_leader() {
                tracing::debug!(policy = %update.id, "Not the leader; dropping status update");
                self.metrics.patch_skipped.inc();
                continue;
            }

            let written = self.patch(&update).await;
            let outcome = if written {
                Trigger::StatusWritten(update.id.clone())
            } else {
                Trigger::StatusFailed(update.id.clone())
            };
            if self.outcomes.send(outcome).is_err() {
                tracing::debug!(policy = %update.id, "Scheduler stopped");
            }

            if written {
                if let Some(event) = &update.event {
                    self.record(&update, event).await;
                }
            }
        }
    }

    async fn patch(&self, update: &Update) -> bool {
        let Update { id, status, .. } = update;
        let api = k8s::Api::<ConfigurationPolicy>::namespaced(self.client.clone(), &id.namespace);
        let patch = make_patch(status);
        let params = k8s::PatchParams::default();

        match time::timeout(self.patch_timeout, api.patch_status(&id.name, &params, &patch)).await
        {
            Ok(Ok(_)) => {
                tracing::debug!(policy = %id, compliant = ?status.compliant, "Patched status");
                self.metrics.patch_succeeded.inc();
                true
            }
            Ok(Err(error)) => {
                tracing::error!(policy = %id, %error, "Failed to patch ConfigurationPolicy status");
                self.metrics.patch_failed.inc();
                false
            }
            Err(_) => {
                tracing::error!(
                    policy = %id,
                    timeout = ?self.patch_timeout,
                    "Timed out patching ConfigurationPolicy status"
                );
                self.metrics.patch_timeout.inc();
                false
            }
        }
    }

    async fn record(&self, update: &Update, event: &ComplianceEvent) {
        let event = match make_event(&update.id, update.uid.as_deref(), event) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(policy = %update.id, %error, "Failed to build compliance event");
                self.metrics.events_failed.inc();
                return;
            }
        };

        let api = k8s::Api::<k8s::api::core::v1::Event>::namespaced(
            self.client.clone(),
            &update.id.namespace,
        );
        match time::timeout(
            self.patch_timeout,
            api.create(&k8s::PostParams::default(), &event),
        )
        .await
        {
            Ok(Ok(_)) => self.metrics.events_published.inc(),
            Ok(Err(error)) => {
                tracing::warn!(policy = %update.id, %error, "Failed to record compliance event");
                self.metrics.events_failed.inc()
            }
            Err(_) => {
                tracing::warn!(policy = %update.id, "Timed out recording compliance event");
                self.metrics.events_failed.inc()
            }
        };
    }
}

use super::*;
use crate::{
    core::{doc, MemoryStore},
    index::Index,
    k8s::ConfigurationPolicy,
};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;

struct Harness {
    store: Arc<MemoryStore>,
    index: SharedIndex,
    triggers: mpsc::UnboundedSender<Trigger>,
    updates: mpsc::Receiver<status::Update>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn spawn(store: MemoryStore, backoff: Backoff) -> Self {
        let store = Arc::new(store);
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        let index = Index::shared(triggers_tx.clone());
        let (updates_tx, updates) = mpsc::channel(16);
        let scheduler = Scheduler::new(
            store.clone(),
            index.clone(),
            status::Leadership::always("test"),
            updates_tx,
            Config {
                concurrency: 2,
                throttle: Duration::ZERO,
                backoff,
                tick: Duration::from_secs(1),
            },
            EvaluationMetrics::default(),
        );
        let task = tokio::spawn(scheduler.run(triggers_rx));
        Self {
            store,
            index,
            triggers: triggers_tx,
            updates,
            task,
        }
    }

    fn apply(&self, policy: ConfigurationPolicy) {
        IndexNamespacedResource::apply(&mut *self.index.write(), policy);
    }

    /// Feeds a published status back into the index, as the policy watch would.
    fn observe(&self, mut policy: ConfigurationPolicy, update: &status::Update) {
        policy.status = Some(update.status.clone());
        self.apply(policy);
    }

    async fn next_update(&mut self) -> status::Update {
        time::timeout(Duration::from_secs(60), self.updates.recv())
            .await
            .expect("update must be published")
            .expect("scheduler must be running")
    }

    async fn settle(&mut self) {
        time::sleep(Duration::from_secs(5)).await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn mk_policy(status: Option<serde_json::Value>) -> ConfigurationPolicy {
    let mut policy = serde_json::json!({
        "apiVersion": "policy.open-cluster-management.io/v1",
        "kind": "ConfigurationPolicy",
        "metadata": { "namespace": "policies", "name": "p", "generation": 1, "uid": "uid-p" },
        "spec": {
            "remediationAction": "inform",
            "object-templates": [{
                "complianceType": "musthave",
                "objectDefinition": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "cm", "namespace": "default" },
                    "data": { "a": "b" },
                },
            }],
        },
    });
    if let Some(status) = status {
        policy["status"] = status;
    }
    serde_json::from_value(policy).expect("policy must decode")
}

fn configmap() -> crate::core::Value {
    doc!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "cm", "namespace": "default" },
        "data": { "a": "b" },
    })
}

#[tokio::test(start_paused = true)]
async fn publishes_evaluations() {
    let mut test = Harness::spawn(MemoryStore::new(), Backoff::default());
    test.apply(mk_policy(None));

    let update = test.next_update().await;
    assert_eq!(update.id, ResourceId::new("policies", "p"));
    assert_eq!(update.status.compliant, Some(ComplianceState::NonCompliant));
    assert_eq!(
        update.status.message.as_deref(),
        Some("configmaps [cm] not found in namespace default")
    );
    assert!(update.event.is_some());
}

#[tokio::test(start_paused = true)]
async fn unchanged_verdicts_refresh_without_events() {
    let mut test = Harness::spawn(MemoryStore::new(), Backoff::default());
    test.apply(mk_policy(None));
    let first = test.next_update().await;
    assert!(first.event.is_some());
    test.observe(mk_policy(None), &first);

    // Re-evaluating yields the same verdict, which is written again with a
    // new evaluation time.
    time::sleep(Duration::from_secs(2)).await;
    test.index
        .write()
        .object_event("v1", "ConfigMap", Some("default"), "cm");
    let refresh = test.next_update().await;
    assert_eq!(refresh.status.compliant, first.status.compliant);
    assert_eq!(refresh.status.message, first.status.message);
    assert_eq!(refresh.event, None);

    // Creating the object changes the verdict.
    test.observe(mk_policy(None), &refresh);
    test.store.insert(configmap()).unwrap();
    test.index
        .write()
        .object_event("v1", "ConfigMap", Some("default"), "cm");
    let update = test.next_update().await;
    assert_eq!(update.status.compliant, Some(ComplianceState::Compliant));
    assert_eq!(
        update.status.message.as_deref(),
        Some("configmaps [cm] found as specified in namespace default")
    );
    assert!(update.event.is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_status_writes_are_retried() {
    let mut test = Harness::spawn(MemoryStore::new(), Backoff::default());
    test.apply(mk_policy(None));
    let first = test.next_update().await;

    // The write never lands, so the index still holds no status.
    test.triggers
        .send(Trigger::StatusFailed(first.id.clone()))
        .unwrap();
    let retry = test.next_update().await;
    assert_eq!(retry.id, first.id);
    assert_eq!(retry.status.compliant, Some(ComplianceState::NonCompliant));
    assert!(retry.event.is_some());

    // Once written, nothing more is published until something changes.
    test.triggers
        .send(Trigger::StatusWritten(retry.id.clone()))
        .unwrap();
    test.settle().await;
    assert!(test.updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_annotate_last_status() {
    let store = MemoryStore::new();
    store.fail_next(100);
    let mut test = Harness::spawn(
        store,
        Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
            attempts: 3,
        },
    );
    test.apply(mk_policy(Some(serde_json::json!({
        "compliant": "Compliant",
        "message": "configmaps [cm] found as specified in namespace default",
    }))));

    let update = test.next_update().await;
    assert_eq!(update.status.compliant, Some(ComplianceState::Compliant));
    assert_eq!(
        update.status.message.as_deref(),
        Some(
            "configmaps [cm] found as specified in namespace default \
             (evaluation error: policy evaluation failed: injected failure)"
        )
    );
    assert_eq!(update.event, None);
}

#[tokio::test(start_paused = true)]
async fn deleted_policies_are_forgotten() {
    let mut test = Harness::spawn(MemoryStore::new(), Backoff::default());
    test.apply(mk_policy(None));
    test.next_update().await;

    IndexNamespacedResource::<ConfigurationPolicy>::delete(
        &mut *test.index.write(),
        "policies".to_string(),
        "p".to_string(),
    );
    test.store.insert(configmap()).unwrap();
    test.index
        .write()
        .object_event("v1", "ConfigMap", Some("default"), "cm");
    test.settle().await;
    assert!(test.updates.try_recv().is_err());
}

#[test]
fn annotations_replace_prior_errors() {
    let error = EvalError::Transient(crate::core::StoreError::Transient("boom".into()));
    let once = annotated(Some("msg"), &error);
    assert_eq!(once, "msg (evaluation error: policy evaluation failed: boom)");
    assert_eq!(annotated(Some(&once), &error), once);
    assert_eq!(annotated(None, &error), "policy evaluation failed: boom");
}

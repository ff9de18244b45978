use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) patch_succeeded: Counter,
    pub(crate) patch_failed: Counter,
    pub(crate) patch_timeout: Counter,
    pub(crate) patch_skipped: Counter,
    pub(crate) events_published: Counter,
    pub(crate) events_failed: Counter,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "patch_succeeded",
            "Count of status patches that succeeded",
            metrics.patch_succeeded.clone(),
        );
        prom.register(
            "patch_failed",
            "Count of status patches that failed",
            metrics.patch_failed.clone(),
        );
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            metrics.patch_timeout.clone(),
        );
        prom.register(
            "patch_skipped",
            "Count of status updates dropped because this replica is not the leader",
            metrics.patch_skipped.clone(),
        );
        prom.register(
            "events_published",
            "Count of compliance events recorded",
            metrics.events_published.clone(),
        );
        prom.register(
            "events_failed",
            "Count of compliance events that could not be recorded",
            metrics.events_failed.clone(),
        );
        metrics
    }
}

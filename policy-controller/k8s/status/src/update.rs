use chrono::{SecondsFormat, Utc};
use config_policy_controller_core::POLICY_CONTROLLER_NAME;
use config_policy_controller_k8s_api::{
    self as k8s, ComplianceState, ConfigurationPolicy, ConfigurationPolicyStatus, Resource,
};
use config_policy_controller_k8s_index::ResourceId;

/// A status to publish for a policy.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub uid: Option<String>,
    pub status: ConfigurationPolicyStatus,

    /// Set when the verdict or its message changed.
    pub event: Option<ComplianceEvent>,
}

/// A compliance transition, recorded as a Kubernetes event on the policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComplianceEvent {
    pub state: ComplianceState,
    pub message: String,
    pub severity: Option<String>,
}

// === impl Update ===

impl Update {
    pub fn new(
        id: ResourceId,
        policy: &ConfigurationPolicy,
        status: ConfigurationPolicyStatus,
    ) -> Self {
        let prior = policy.status.as_ref();
        let transitioned = prior.map_or(true, |prior| {
            prior.compliant != status.compliant || prior.message != status.message
        });
        let event = status
            .compliant
            .filter(|_| transitioned)
            .map(|state| ComplianceEvent {
                state,
                message: status.message.clone().unwrap_or_default(),
                severity: policy.spec.severity.clone(),
            });
        Self {
            id,
            uid: policy.metadata.uid.clone(),
            status,
            event,
        }
    }
}

// === impl ComplianceEvent ===

impl ComplianceEvent {
    fn event_type(&self) -> &'static str {
        match self.state {
            ComplianceState::Compliant => "Normal",
            ComplianceState::NonCompliant | ComplianceState::Terminating => "Warning",
        }
    }

    /// Renders the event text, e.g. `NonCompliant; violation - configmaps [cm] not found`.
    pub fn note(&self) -> String {
        let kind = match self.state {
            ComplianceState::Compliant => "notification",
            ComplianceState::NonCompliant => "violation",
            ComplianceState::Terminating => "pending deletion",
        };
        format!("{}; {kind} - {}", self.state, self.message)
    }
}

pub fn make_patch(status: &ConfigurationPolicyStatus) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": ConfigurationPolicy::api_version(&()),
        "kind": ConfigurationPolicy::kind(&()),
        "status": status,
    });
    k8s::Patch::Merge(value)
}

pub fn make_event(
    id: &ResourceId,
    uid: Option<&str>,
    event: &ComplianceEvent,
) -> serde_json::Result<k8s::api::core::v1::Event> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut annotations = serde_json::Map::new();
    if let Some(severity) = &event.severity {
        annotations.insert("policy.open-cluster-management.io/severity".into(), severity.clone().into());
    }
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "generateName": format!("{}.", id.name),
            "namespace": id.namespace,
            "annotations": annotations,
        },
        "involvedObject": {
            "apiVersion": ConfigurationPolicy::api_version(&()),
            "kind": ConfigurationPolicy::kind(&()),
            "namespace": id.namespace,
            "name": id.name,
            "uid": uid,
        },
        "reason": format!("Policy: {}", id.name),
        "message": event.note(),
        "type": event.event_type(),
        "source": { "component": POLICY_CONTROLLER_NAME },
        "reportingComponent": POLICY_CONTROLLER_NAME,
        "firstTimestamp": now,
        "lastTimestamp": now,
        "count": 1,
    }))
}

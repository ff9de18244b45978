use crate::{
    duration,
    labels::{Map, RawExpression, RawSelector},
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

pub const API_GROUP: &str = "policy.open-cluster-management.io";

/// Added to enforced policies that prune their objects on deletion.
pub const PRUNE_FINALIZER: &str = "policy.open-cluster-management.io/delete-related-objects";

/// Describes a set of object templates that must (or must not) exist in the
/// cluster, and how the controller should react when they don't.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "policy.open-cluster-management.io",
    version = "v1",
    kind = "ConfigurationPolicy",
    status = "ConfigurationPolicyStatus",
    derive = "PartialEq",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationPolicySpec {
    #[serde(default)]
    pub remediation_action: RemediationAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(default)]
    pub namespace_selector: NamespaceSelector,

    #[serde(default, rename = "object-templates")]
    pub object_templates: Vec<ObjectTemplate>,

    #[serde(default)]
    pub evaluation_interval: EvaluationInterval,

    #[serde(default)]
    pub prune_object_behavior: PruneObjectBehavior,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum RemediationAction {
    #[default]
    Inform,
    Enforce,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum ComplianceType {
    #[default]
    MustHave,
    MustOnlyHave,
    MustNotHave,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PruneObjectBehavior {
    #[default]
    None,
    DeleteIfCreated,
    DeleteAll,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum RecordDiff {
    None,
    Log,
    InStatus,
}

/// Selects namespaces by name globs and, optionally, by namespace labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<Map>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<RawExpression>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplate {
    #[serde(default)]
    pub compliance_type: ComplianceType,

    #[serde(default)]
    pub object_definition: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<RawSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_diff: Option<RecordDiff>,
}

/// Raw evaluation intervals, parsed with [`EvaluationInterval::compliant`]
/// and [`EvaluationInterval::noncompliant`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EvaluationInterval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliant: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noncompliant: Option<String>,
}

/// How often a policy is re-evaluated while in a given compliance state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Interval {
    /// Only re-evaluate on watch events.
    #[default]
    Watch,

    /// Never re-evaluate until the policy itself changes.
    Never,

    Every(Duration),
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliant: Option<ComplianceState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub compliancy_details: Vec<TemplateStatus>,

    #[serde(default)]
    pub related_objects: Vec<RelatedObject>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated_generation: Option<i64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    Terminating,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStatus {
    pub compliant: ComplianceState,
    pub message: String,
}

/// An object that a policy evaluated.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObject {
    pub object: ObjectResource,
    pub compliant: ComplianceState,
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<ObjectProperties>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ObjectMetadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_policy: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

// === impl ConfigurationPolicySpec ===

impl ConfigurationPolicySpec {
    /// Returns true when the policy deletes the objects it tracks once the
    /// policy itself is deleted.
    pub fn prunes_objects(&self) -> bool {
        self.remediation_action == RemediationAction::Enforce
            && self.prune_object_behavior != PruneObjectBehavior::None
    }
}

// === impl NamespaceSelector ===

impl NamespaceSelector {
    pub fn label_selector(&self) -> RawSelector {
        RawSelector {
            match_labels: self.match_labels.clone(),
            match_expressions: self.match_expressions.clone(),
        }
    }

    pub fn has_label_criteria(&self) -> bool {
        self.match_labels.as_ref().is_some_and(|m| !m.is_empty())
            || self
                .match_expressions
                .as_ref()
                .is_some_and(|e| !e.is_empty())
    }
}

// === impl EvaluationInterval ===

impl EvaluationInterval {
    pub fn compliant(&self) -> Result<Interval, duration::ParseError> {
        parse_interval(self.compliant.as_deref())
    }

    pub fn noncompliant(&self) -> Result<Interval, duration::ParseError> {
        parse_interval(self.noncompliant.as_deref())
    }
}

fn parse_interval(value: Option<&str>) -> Result<Interval, duration::ParseError> {
    match value.map(str::trim) {
        None | Some("") => Ok(Interval::Watch),
        Some(v) if v.eq_ignore_ascii_case("watch") => Ok(Interval::Watch),
        Some(v) if v.eq_ignore_ascii_case("never") => Ok(Interval::Never),
        Some(v) => {
            let every = duration::parse(v)?;
            if every.is_zero() {
                return Ok(Interval::Watch);
            }
            Ok(Interval::Every(every))
        }
    }
}

// === impl RemediationAction ===

impl FromStr for RemediationAction {
    type Err = InvalidEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inform" => Ok(Self::Inform),
            "enforce" => Ok(Self::Enforce),
            _ => Err(InvalidEnum::new("remediationAction", s)),
        }
    }
}

impl TryFrom<String> for RemediationAction {
    type Error = InvalidEnum;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inform => f.write_str("inform"),
            Self::Enforce => f.write_str("enforce"),
        }
    }
}

// === impl ComplianceType ===

impl FromStr for ComplianceType {
    type Err = InvalidEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "musthave" => Ok(Self::MustHave),
            "mustonlyhave" => Ok(Self::MustOnlyHave),
            "mustnothave" => Ok(Self::MustNotHave),
            _ => Err(InvalidEnum::new("complianceType", s)),
        }
    }
}

impl TryFrom<String> for ComplianceType {
    type Error = InvalidEnum;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ComplianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MustHave => f.write_str("musthave"),
            Self::MustOnlyHave => f.write_str("mustonlyhave"),
            Self::MustNotHave => f.write_str("mustnothave"),
        }
    }
}

// === impl ComplianceState ===

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compliant => f.write_str("Compliant"),
            Self::NonCompliant => f.write_str("NonCompliant"),
            Self::Terminating => f.write_str("Terminating"),
        }
    }
}

impl From<bool> for ComplianceState {
    fn from(compliant: bool) -> Self {
        if compliant {
            Self::Compliant
        } else {
            Self::NonCompliant
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {field}: {value:?}")]
pub struct InvalidEnum {
    field: &'static str,
    value: String,
}

impl InvalidEnum {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

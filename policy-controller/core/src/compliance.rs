//! Rolls per-object outcomes up into template and policy verdicts.

use config_policy_controller_k8s_api::{
    policy::TemplateStatus, ComplianceState, ComplianceType,
};
use std::collections::{BTreeMap, BTreeSet};

/// What an evaluation found for a single object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    /// Present and matching the template.
    Matched,
    /// Present but differing from the template.
    Mismatched,
    /// Required but absent.
    Missing,
    /// Present although the template forbids it.
    Present,
    /// Absent as the template requires.
    Absent,
    /// Deleted, but still present behind a finalizer.
    Pending,
}

/// Accumulates the outcomes of one object template.
#[derive(Clone, Debug)]
pub struct TemplateTally {
    kind: String,
    plural: String,
    mode: ComplianceType,
    /// Object names keyed by outcome and namespace. An empty name set records
    /// that no object satisfied an unnamed template in that namespace.
    objects: BTreeMap<(Outcome, String), BTreeSet<String>>,
    selector_matched_nothing: bool,
}

/// A policy-level verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub state: ComplianceState,
    pub message: String,
    pub details: Vec<TemplateStatus>,
}

// === impl Outcome ===

impl Outcome {
    pub fn state(self) -> ComplianceState {
        match self {
            Self::Matched | Self::Absent => ComplianceState::Compliant,
            Self::Mismatched | Self::Missing | Self::Present => ComplianceState::NonCompliant,
            Self::Pending => ComplianceState::Terminating,
        }
    }

    /// The reason recorded for related objects.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Matched => "Resource found as expected",
            Self::Mismatched => "Resource found but does not match",
            Self::Missing => "Resource not found but should exist",
            Self::Present => "Resource found but should not exist",
            Self::Absent => "Resource not found as expected",
            Self::Pending => "Deletion pending",
        }
    }

    fn phrase(self) -> &'static str {
        match self {
            Self::Matched => "found as specified",
            Self::Mismatched => "found but not as specified",
            Self::Missing => "not found",
            Self::Present => "found",
            Self::Absent => "missing as expected",
            Self::Pending => "found with a pending deletion",
        }
    }
}

// === impl TemplateTally ===

impl TemplateTally {
    pub fn new(kind: impl ToString, plural: impl ToString, mode: ComplianceType) -> Self {
        Self {
            kind: kind.to_string(),
            plural: plural.to_string(),
            mode,
            objects: BTreeMap::new(),
            selector_matched_nothing: false,
        }
    }

    pub fn record(&mut self, namespace: Option<&str>, name: impl ToString, outcome: Outcome) {
        self.objects
            .entry((outcome, namespace.unwrap_or_default().to_string()))
            .or_default()
            .insert(name.to_string());
    }

    /// Records that no object satisfied an unnamed template in a namespace.
    pub fn record_none(&mut self, namespace: Option<&str>) {
        let outcome = match self.mode {
            ComplianceType::MustNotHave => Outcome::Absent,
            _ => Outcome::Missing,
        };
        self.objects
            .entry((outcome, namespace.unwrap_or_default().to_string()))
            .or_default();
    }

    /// Records that the object selector matched no objects at all.
    pub fn record_no_selector_match(&mut self) {
        self.selector_matched_nothing = true;
    }

    pub fn state(&self) -> ComplianceState {
        let mut state = ComplianceState::Compliant;
        for (outcome, _) in self.objects.keys() {
            match outcome.state() {
                ComplianceState::Terminating => return ComplianceState::Terminating,
                ComplianceState::NonCompliant => state = ComplianceState::NonCompliant,
                ComplianceState::Compliant => {}
            }
        }

        let required = self.mode != ComplianceType::MustNotHave;
        if required && (self.selector_matched_nothing || self.objects.is_empty()) {
            state = ComplianceState::NonCompliant;
        }
        state
    }

    /// Describes the objects that determined the template's state, grouped by
    /// outcome and namespace, with sorted names.
    pub fn message(&self) -> String {
        let state = self.state();
        let mut parts = Vec::new();
        if self.selector_matched_nothing {
            parts.push(format!(
                "No objects of kind {} were matched from the policy objectSelector",
                self.kind
            ));
        }

        for ((outcome, namespace), names) in self.objects.iter() {
            if outcome.state() != state {
                continue;
            }
            let scope = if namespace.is_empty() {
                String::new()
            } else {
                format!(" in namespace {namespace}")
            };
            if names.is_empty() {
                match outcome {
                    Outcome::Missing => parts.push(format!(
                        "No instances of `{}` found as specified{scope}",
                        self.plural
                    )),
                    _ => parts.push(format!("{} {}{scope}", self.plural, outcome.phrase())),
                }
                continue;
            }
            let names = names.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
            parts.push(format!("{} [{names}] {}{scope}", self.plural, outcome.phrase()));
        }

        parts.join("; ")
    }

    pub fn status(&self) -> TemplateStatus {
        TemplateStatus {
            compliant: self.state(),
            message: self.message(),
        }
    }
}

// === impl Verdict ===

impl Verdict {
    /// Folds template statuses into a policy verdict: any terminating template
    /// makes the policy terminating, otherwise any noncompliant template makes
    /// it noncompliant.
    pub fn aggregate(details: Vec<TemplateStatus>) -> Self {
        let state = if details
            .iter()
            .any(|d| d.compliant == ComplianceState::Terminating)
        {
            ComplianceState::Terminating
        } else if details
            .iter()
            .any(|d| d.compliant == ComplianceState::NonCompliant)
        {
            ComplianceState::NonCompliant
        } else {
            ComplianceState::Compliant
        };

        let message = details
            .iter()
            .map(|d| d.message.as_str())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            state,
            message,
            details,
        }
    }
}

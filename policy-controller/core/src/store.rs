use crate::value::Value;
use config_policy_controller_k8s_api::labels::{self, Selector};

mod memory;

pub use self::memory::MemoryStore;

/// How a kind is served by the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KindInfo {
    pub api_version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: labels::Map,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// The object was modified concurrently. Retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached or timed out. Retried.
    #[error("{0}")]
    Transient(String),

    /// The store refused the request, e.g. because the object is invalid.
    #[error("{0}")]
    Rejected(String),
}

/// Models the cluster API as seen by policy evaluation.
///
/// Objects are untyped documents. Reads of a missing object return `None`
/// and deletes of a missing object succeed.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn resolve_kind(&self, api_version: &str, kind: &str)
        -> Result<Option<KindInfo>, StoreError>;

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>, StoreError>;

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, StoreError>;

    async fn list(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> Result<Vec<Value>, StoreError>;

    async fn create(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value, StoreError>;

    async fn update(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value, StoreError>;

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Replaces the finalizers of a `ConfigurationPolicy`.
    async fn set_policy_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError>;
}

// === impl StoreError ===

impl StoreError {
    /// Returns true if the failed request may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }
}

// === impl KindInfo ===

impl KindInfo {
    pub fn new(api_version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default()
    }
}

/// Reads `metadata.labels` from an object.
pub fn labels_of(object: &Value) -> labels::Map {
    object
        .pointer(&["metadata", "labels"])
        .and_then(Value::as_map)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub fn name_of(object: &Value) -> Option<&str> {
    object.str_at(&["metadata", "name"])
}

pub fn uid_of(object: &Value) -> Option<&str> {
    object.str_at(&["metadata", "uid"])
}

pub fn is_deleting(object: &Value) -> bool {
    object
        .pointer(&["metadata", "deletionTimestamp"])
        .is_some_and(|ts| !ts.is_null())
}

use super::{labels_of, name_of, KindInfo, NamespaceInfo, Store, StoreError};
use crate::value::{Map, Value};
use config_policy_controller_k8s_api::labels::Selector;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

/// An in-memory cluster snapshot.
///
/// Deleting an object that carries finalizers only marks it with a
/// `deletionTimestamp`; it disappears once its finalizers are removed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    failures: AtomicUsize,
}

#[derive(Debug, Default)]
struct State {
    kinds: Vec<KindInfo>,
    objects: BTreeMap<Key, Value>,
    next_uid: u64,
    next_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

const DELETION_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

// === impl MemoryStore ===

impl MemoryStore {
    /// Creates a store that serves the common built-in kinds.
    pub fn new() -> Self {
        let store = Self::default();
        for (api_version, kind, plural, namespaced) in [
            ("v1", "Namespace", "namespaces", false),
            ("v1", "ConfigMap", "configmaps", true),
            ("v1", "Secret", "secrets", true),
            ("v1", "Pod", "pods", true),
            ("v1", "Service", "services", true),
            ("v1", "ServiceAccount", "serviceaccounts", true),
            ("v1", "LimitRange", "limitranges", true),
            ("v1", "ResourceQuota", "resourcequotas", true),
            ("apps/v1", "Deployment", "deployments", true),
            ("apps/v1", "StatefulSet", "statefulsets", true),
            ("apps/v1", "DaemonSet", "daemonsets", true),
            ("networking.k8s.io/v1", "NetworkPolicy", "networkpolicies", true),
            ("rbac.authorization.k8s.io/v1", "Role", "roles", true),
            ("rbac.authorization.k8s.io/v1", "RoleBinding", "rolebindings", true),
            ("rbac.authorization.k8s.io/v1", "ClusterRole", "clusterroles", false),
            (
                "rbac.authorization.k8s.io/v1",
                "ClusterRoleBinding",
                "clusterrolebindings",
                false,
            ),
            (
                "policy.open-cluster-management.io/v1",
                "ConfigurationPolicy",
                "configurationpolicies",
                true,
            ),
        ] {
            store.register(KindInfo::new(api_version, kind, plural, namespaced));
        }
        store
    }

    pub fn register(&self, kind: KindInfo) {
        let mut state = self.state.write();
        state
            .kinds
            .retain(|k| !(k.api_version == kind.api_version && k.kind == kind.kind));
        state.kinds.push(kind);
    }

    /// Adds or replaces an object, registering its kind if it's unknown.
    pub fn insert(&self, object: Value) -> Result<(), StoreError> {
        let (api_version, kind) = type_of(&object)?;
        let namespace = object.str_at(&["metadata", "namespace"]).map(str::to_string);
        let known = self.state.read().find(&api_version, &kind).is_some();
        if !known {
            let plural = format!("{}s", kind.to_lowercase());
            self.register(KindInfo::new(&api_version, &kind, &plural, namespace.is_some()));
        }

        let mut state = self.state.write();
        let info = state
            .find(&api_version, &kind)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("unknown kind {kind}")))?;
        let key = Key::of(&info, namespace.as_deref(), &object)?;
        let object = state.stamp(object, None);
        state.objects.insert(key, object);
        Ok(())
    }

    /// Removes finalizers from an object, completing a pending deletion.
    pub fn clear_finalizers(&self, kind: &KindInfo, namespace: Option<&str>, name: &str) {
        let mut state = self.state.write();
        let key = Key::new(kind, namespace, name);
        let Some(object) = state.objects.get_mut(&key) else {
            return;
        };
        if let Some(meta) = object
            .as_map_mut()
            .and_then(|o| o.get_mut("metadata"))
            .and_then(Value::as_map_mut)
        {
            meta.shift_remove("finalizers");
        }
        if super::is_deleting(object) {
            state.objects.remove(&key);
        }
    }

    /// Makes the next `n` requests fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Returns all objects, ordered by type, namespace and name.
    pub fn objects(&self) -> Vec<Value> {
        self.state.read().objects.values().cloned().collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Transient("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<Option<KindInfo>, StoreError> {
        self.check()?;
        Ok(self.state.read().find(api_version, kind).cloned())
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>, StoreError> {
        self.check()?;
        let state = self.state.read();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == "v1" && k.kind == "Namespace")
            .map(|(k, obj)| NamespaceInfo {
                name: k.name.clone(),
                labels: labels_of(obj),
            })
            .collect())
    }

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.check()?;
        let key = Key::new(kind, namespace, name);
        Ok(self.state.read().objects.get(&key).cloned())
    }

    async fn list(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> Result<Vec<Value>, StoreError> {
        self.check()?;
        let state = self.state.read();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == kind.api_version && k.kind == kind.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .filter(|(_, obj)| selector.map_or(true, |s| s.matches_map(&labels_of(obj))))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value, StoreError> {
        self.check()?;
        let mut state = self.state.write();
        let key = Key::of(kind, namespace, &object)?;
        if state.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} {} already exists",
                kind.kind, key.name
            )));
        }
        let object = state.stamp(object, None);
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value, StoreError> {
        self.check()?;
        let mut state = self.state.write();
        let key = Key::of(kind, namespace, &object)?;
        let uid = match state.objects.get(&key) {
            Some(existing) => super::uid_of(existing).map(str::to_string),
            None => {
                return Err(StoreError::NotFound {
                    kind: kind.kind.clone(),
                    name: key.name,
                })
            }
        };
        let object = state.stamp(object, uid);
        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write();
        let key = Key::new(kind, namespace, name);
        let Some(object) = state.objects.get_mut(&key) else {
            return Ok(());
        };

        let finalized = object
            .pointer(&["metadata", "finalizers"])
            .is_some_and(|f| matches!(f, Value::Seq(items) if !items.is_empty()));
        if !finalized {
            state.objects.remove(&key);
            return Ok(());
        }

        if let Some(meta) = object
            .as_map_mut()
            .and_then(|o| o.get_mut("metadata"))
            .and_then(Value::as_map_mut)
        {
            meta.entry("deletionTimestamp".to_string())
                .or_insert_with(|| Value::from(DELETION_TIMESTAMP));
        }
        Ok(())
    }

    async fn set_policy_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let kind = KindInfo::new(
            "policy.open-cluster-management.io/v1",
            "ConfigurationPolicy",
            "configurationpolicies",
            true,
        );
        let mut state = self.state.write();
        let key = Key::new(&kind, Some(namespace), name);
        let Some(meta) = state
            .objects
            .get_mut(&key)
            .and_then(Value::as_map_mut)
            .and_then(|o| o.get_mut("metadata"))
            .and_then(Value::as_map_mut)
        else {
            return Ok(());
        };

        if finalizers.is_empty() {
            meta.shift_remove("finalizers");
        } else {
            let finalizers = finalizers.into_iter().map(Value::String).collect();
            meta.insert("finalizers".to_string(), Value::Seq(finalizers));
        }

        let deleting = meta.get("deletionTimestamp").is_some_and(|ts| !ts.is_null());
        if deleting && !meta.contains_key("finalizers") {
            state.objects.remove(&key);
        }
        Ok(())
    }
}

// === impl State ===

impl State {
    fn find(&self, api_version: &str, kind: &str) -> Option<&KindInfo> {
        self.kinds
            .iter()
            .find(|k| k.api_version == api_version && k.kind == kind)
    }

    /// Assigns a UID (keeping `uid` when given) and a new resource version.
    fn stamp(&mut self, mut object: Value, uid: Option<String>) -> Value {
        self.next_version += 1;
        let version = self.next_version.to_string();
        let uid = match uid.or_else(|| super::uid_of(&object).map(str::to_string)) {
            Some(uid) => uid,
            None => {
                self.next_uid += 1;
                format!("uid-{}", self.next_uid)
            }
        };

        if let Some(obj) = object.as_map_mut() {
            let meta = obj
                .entry("metadata".to_string())
                .or_insert_with(|| Value::Map(Map::new()));
            if let Some(meta) = meta.as_map_mut() {
                meta.insert("uid".to_string(), Value::String(uid));
                meta.insert("resourceVersion".to_string(), Value::String(version));
            }
        }
        object
    }
}

// === impl Key ===

impl Key {
    fn new(kind: &KindInfo, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: kind.api_version.clone(),
            kind: kind.kind.clone(),
            namespace: if kind.namespaced {
                namespace.unwrap_or_default().to_string()
            } else {
                String::new()
            },
            name: name.to_string(),
        }
    }

    fn of(kind: &KindInfo, namespace: Option<&str>, object: &Value) -> Result<Self, StoreError> {
        let name = name_of(object)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Rejected(format!("{} is missing a name", kind.kind)))?;
        let namespace = namespace.or_else(|| object.str_at(&["metadata", "namespace"]));
        if kind.namespaced && namespace.is_none() {
            return Err(StoreError::Rejected(format!(
                "{} {name} is missing a namespace",
                kind.kind
            )));
        }
        Ok(Self::new(kind, namespace, name))
    }
}

fn type_of(object: &Value) -> Result<(String, String), StoreError> {
    match (object.str_at(&["apiVersion"]), object.str_at(&["kind"])) {
        (Some(api_version), Some(kind)) => Ok((api_version.to_string(), kind.to_string())),
        _ => Err(StoreError::Rejected(
            "objects require apiVersion and kind".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{doc, store::is_deleting};

    fn configmaps() -> KindInfo {
        KindInfo::new("v1", "ConfigMap", "configmaps", true)
    }

    #[tokio::test]
    async fn create_assigns_uids() {
        let store = MemoryStore::new();
        let cm = store
            .create(
                &configmaps(),
                Some("default"),
                doc!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } }),
            )
            .await
            .unwrap();
        assert_eq!(super::super::uid_of(&cm), Some("uid-1"));

        let err = store
            .create(&configmaps(), Some("default"), cm.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let updated = store.update(&configmaps(), Some("default"), cm).await.unwrap();
        assert_eq!(super::super::uid_of(&updated), Some("uid-1"));
    }

    #[tokio::test]
    async fn lists_by_namespace_and_labels() {
        let store = MemoryStore::new();
        for (ns, name, app) in [("a", "x", "web"), ("a", "y", "db"), ("b", "z", "web")] {
            store
                .insert(doc!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": name, "namespace": ns, "labels": { "app": app } },
                }))
                .unwrap();
        }

        let selector = Selector::from_iter(Some(("app", "web")));
        let names = |objs: Vec<Value>| {
            objs.iter()
                .map(|o| name_of(o).unwrap().to_string())
                .collect::<Vec<_>>()
        };
        let all = store.list(&configmaps(), None, Some(&selector)).await.unwrap();
        assert_eq!(names(all), ["x", "z"]);
        let in_a = store.list(&configmaps(), Some("a"), None).await.unwrap();
        assert_eq!(names(in_a), ["x", "y"]);
    }

    #[tokio::test]
    async fn finalizers_block_deletion() {
        let store = MemoryStore::new();
        store
            .insert(doc!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "a", "namespace": "default", "finalizers": ["test/block"] },
            }))
            .unwrap();

        store.delete(&configmaps(), Some("default"), "a").await.unwrap();
        let obj = store.get(&configmaps(), Some("default"), "a").await.unwrap();
        assert!(obj.as_ref().is_some_and(is_deleting));

        store.clear_finalizers(&configmaps(), Some("default"), "a");
        let obj = store.get(&configmaps(), Some("default"), "a").await.unwrap();
        assert!(obj.is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next(1);
        let err = store.namespaces().await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.namespaces().await.is_ok());
    }
}

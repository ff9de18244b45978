//! A [`Store`] backed by the Kubernetes API.

use crate::{
    core::{
        store::{KindInfo, NamespaceInfo, Store, StoreError},
        Value,
    },
    index::SharedIndex,
    k8s,
};
use ahash::AHashMap as HashMap;
use k8s::{
    labels::Selector, ApiResource, ConfigurationPolicy, DeleteParams, DynamicObject,
    GroupVersionKind, ListParams, Patch, PatchParams, PostParams, ResourceExt,
};
use kube::discovery::{self, Scope};
use parking_lot::RwLock;

pub struct KubeStore {
    client: k8s::Client,
    index: SharedIndex,

    /// Kinds resolved through discovery. Unknown kinds aren't cached so that
    /// a CRD installed later is picked up.
    kinds: RwLock<HashMap<(String, String), KindInfo>>,
}

impl KubeStore {
    pub fn new(client: k8s::Client, index: SharedIndex) -> Self {
        Self {
            client,
            index,
            kinds: Default::default(),
        }
    }

    fn api(&self, kind: &KindInfo, namespace: Option<&str>) -> k8s::Api<DynamicObject> {
        let resource = api_resource(kind);
        match namespace {
            Some(ns) if kind.namespaced => {
                k8s::Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => k8s::Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<Option<KindInfo>, StoreError> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(info) = self.kinds.read().get(&key) {
            return Ok(Some(info.clone()));
        }

        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = match discovery::pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            Err(kube::Error::Discovery(error)) => {
                tracing::debug!(%api_version, %kind, %error, "Kind not found");
                return Ok(None);
            }
            Err(kube::Error::Api(error)) if error.code == 404 => return Ok(None),
            Err(error) => return Err(store_error(error)),
        };

        let info = KindInfo::new(
            api_version,
            kind,
            &resource.plural,
            matches!(caps.scope, Scope::Namespaced),
        );
        self.kinds.write().insert(key, info.clone());
        Ok(Some(info))
    }

    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>, StoreError> {
        let cached = self.index.read().namespaces();
        if !cached.is_empty() {
            return Ok(cached);
        }

        // The namespace watch hasn't synced yet.
        let api = k8s::Api::<k8s::Namespace>::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(store_error)?;
        let mut namespaces = list
            .items
            .into_iter()
            .map(|ns| NamespaceInfo {
                labels: ns.labels().clone(),
                name: ns.name_unchecked(),
            })
            .collect::<Vec<_>>();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, StoreError> {
        let object = self
            .api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(store_error)?;
        object.map(to_value).transpose()
    }

    async fn list(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        selector: Option<&Selector>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(&selector.to_query());
        }
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(store_error)?;
        list.items.into_iter().map(to_value).collect()
    }

    async fn create(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value, StoreError> {
        let object = from_value(object)?;
        let created = self
            .api(kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(store_error)?;
        to_value(created)
    }

    async fn update(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Value, StoreError> {
        let object = from_value(object)?;
        let name = object.name_any();
        let updated = self
            .api(kind, namespace)
            .replace(&name, &PostParams::default(), &object)
            .await
            .map_err(store_error)?;
        to_value(updated)
    }

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(error)) if error.code == 404 => Ok(()),
            Err(error) => Err(store_error(error)),
        }
    }

    async fn set_policy_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let api = k8s::Api::<ConfigurationPolicy>::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(serde_json::json!({
            "metadata": { "finalizers": finalizers },
        }));
        match api.patch(name, &PatchParams::default(), &patch).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(error)) if error.code == 404 => Ok(()),
            Err(error) => Err(store_error(error)),
        }
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.rsplit_once('/').unwrap_or(("", api_version))
}

pub(crate) fn api_resource(kind: &KindInfo) -> ApiResource {
    let (group, version) = split_api_version(&kind.api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: kind.api_version.clone(),
        kind: kind.kind.clone(),
        plural: kind.plural.clone(),
    }
}

fn to_value(object: DynamicObject) -> Result<Value, StoreError> {
    serde_json::to_value(object)
        .map(Value::from)
        .map_err(|error| StoreError::Rejected(error.to_string()))
}

fn from_value(object: Value) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(serde_json::Value::from(object))
        .map_err(|error| StoreError::Rejected(error.to_string()))
}

/// Classifies an API error. Conflicts, throttling and server-side failures
/// are retried; anything else is reported back to the policy.
fn store_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(response) => match response.code {
            409 => StoreError::Conflict(response.message),
            429 | 500..=599 => StoreError::Transient(response.message),
            _ => StoreError::Rejected(response.message),
        },
        error => StoreError::Transient(error.to_string()),
    }
}

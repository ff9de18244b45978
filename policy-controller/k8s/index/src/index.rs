use crate::ResourceId;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use config_policy_controller_core::{NamespaceInfo, ObjectId};
use config_policy_controller_k8s_api::{
    self as k8s, labels, ConfigurationPolicy, ObjectTemplate, ResourceExt,
};
use parking_lot::RwLock;
use std::{collections::BTreeSet, fmt, sync::Arc};
use tokio::sync::{mpsc::UnboundedSender, watch};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Asks the scheduler to evaluate a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The policy was created, its spec changed, or it started terminating.
    Spec(ResourceId),

    /// An object the policy depends on changed.
    Watch(ResourceId),

    /// The policy is gone from the cluster.
    Deleted(ResourceId),

    /// The policy's status was written.
    StatusWritten(ResourceId),

    /// Writing the policy's status failed. Nothing records the result of
    /// the last evaluation, so it must be repeated.
    StatusFailed(ResourceId),
}

/// A kind of object that must be watched on behalf of some policy.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindRef {
    pub api_version: String,
    pub kind: String,
}

#[derive(Debug)]
pub struct Index {
    policies: HashMap<ResourceId, Policy>,
    namespaces: HashMap<String, labels::Map>,

    /// Maps each related object to the policies that list it in their status.
    related: HashMap<ObjectId, HashSet<ResourceId>>,

    kinds: watch::Sender<BTreeSet<KindRef>>,
    triggers: UnboundedSender<Trigger>,
}

#[derive(Debug)]
struct Policy {
    resource: Arc<ConfigurationPolicy>,
    generation: Option<i64>,
    deleting: bool,
    interests: Vec<Interest>,
    related: Vec<ObjectId>,
}

/// The objects a template could match: all objects of a kind, optionally
/// narrowed to a namespace and a name.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Interest {
    kind: KindRef,
    namespace: Option<String>,
    name: Option<String>,
}

// === impl KindRef ===

impl KindRef {
    pub fn new(api_version: impl ToString, kind: impl ToString) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version)
    }
}

// === impl Index ===

impl Index {
    pub fn shared(triggers: UnboundedSender<Trigger>) -> SharedIndex {
        let (kinds, _) = watch::channel(BTreeSet::new());
        Arc::new(RwLock::new(Self {
            policies: HashMap::new(),
            namespaces: HashMap::new(),
            related: HashMap::new(),
            kinds,
            triggers,
        }))
    }

    /// Watches the set of kinds that policies currently depend on.
    pub fn watched_kinds(&self) -> watch::Receiver<BTreeSet<KindRef>> {
        self.kinds.subscribe()
    }

    pub fn policy(&self, id: &ResourceId) -> Option<Arc<ConfigurationPolicy>> {
        self.policies.get(id).map(|p| p.resource.clone())
    }

    pub fn policy_ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.policies.keys()
    }

    /// Returns the cached namespaces, sorted by name.
    pub fn namespaces(&self) -> Vec<NamespaceInfo> {
        let mut namespaces = self
            .namespaces
            .iter()
            .map(|(name, labels)| NamespaceInfo {
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect::<Vec<_>>();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        namespaces
    }

    pub(crate) fn related_len(&self) -> usize {
        self.related.len()
    }

    pub(crate) fn namespaces_len(&self) -> usize {
        self.namespaces.len()
    }

    pub(crate) fn kinds_len(&self) -> usize {
        self.kinds.borrow().len()
    }

    pub(crate) fn policies_by_ns(&self) -> HashMap<&str, usize> {
        let mut by_ns = HashMap::new();
        for id in self.policies.keys() {
            *by_ns.entry(id.namespace.as_str()).or_default() += 1;
        }
        by_ns
    }

    /// Handles a change to an object of a watched kind.
    pub fn object_event(
        &mut self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) {
        let object = ObjectId::new(api_version, kind, namespace, name);

        let mut targets = BTreeSet::new();
        if let Some(ids) = self.related.get(&object) {
            targets.extend(ids.iter().cloned());
        }
        for (id, policy) in &self.policies {
            if policy.interests.iter().any(|i| i.matches(&object)) {
                targets.insert(id.clone());
            }
        }

        if !targets.is_empty() {
            tracing::debug!(%object, policies = targets.len(), "Object changed");
        }
        for id in targets {
            self.send(Trigger::Watch(id));
        }
    }

    fn namespaces_changed(&self) {
        let mut targets = self
            .policies
            .iter()
            .filter(|(_, p)| p.selects_namespaces())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        targets.sort();
        for id in targets {
            self.send(Trigger::Watch(id));
        }
    }

    fn link(&mut self, id: &ResourceId, related: &[ObjectId]) {
        for object in related {
            self.related
                .entry(object.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    fn unlink(&mut self, id: &ResourceId, related: &[ObjectId]) {
        for object in related {
            if let Some(ids) = self.related.get_mut(object) {
                ids.remove(id);
                if ids.is_empty() {
                    self.related.remove(object);
                }
            }
        }
    }

    fn update_kinds(&self) {
        let kinds = self
            .policies
            .values()
            .flat_map(|p| {
                p.interests.iter().map(|i| i.kind.clone()).chain(
                    p.related
                        .iter()
                        .map(|o| KindRef::new(&o.api_version, &o.kind)),
                )
            })
            .collect::<BTreeSet<_>>();

        self.kinds.send_if_modified(|current| {
            if *current == kinds {
                return false;
            }
            tracing::debug!(kinds = kinds.len(), "Watched kinds changed");
            *current = kinds;
            true
        });
    }

    fn send(&self, trigger: Trigger) {
        if let Err(error) = self.triggers.send(trigger) {
            tracing::error!(trigger = ?error.0, "Failed to send trigger");
        }
    }
}

impl kubert::index::IndexNamespacedResource<ConfigurationPolicy> for Index {
    fn apply(&mut self, resource: ConfigurationPolicy) {
        let Some(namespace) = resource.namespace() else {
            tracing::warn!(name = %resource.name_any(), "Ignoring ConfigurationPolicy without a namespace");
            return;
        };
        let id = ResourceId::new(namespace, resource.name_unchecked());
        let policy = Policy::new(resource);

        let changed = match self.policies.get(&id) {
            None => true,
            Some(prior) => {
                prior.generation != policy.generation || prior.deleting != policy.deleting
            }
        };

        if let Some(prior) = self.policies.remove(&id) {
            self.unlink(&id, &prior.related);
        }
        self.link(&id, &policy.related);
        self.policies.insert(id.clone(), policy);
        self.update_kinds();

        if changed {
            tracing::debug!(policy = %id, "Policy changed");
            self.send(Trigger::Spec(id));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if let Some(prior) = self.policies.remove(&id) {
            self.unlink(&id, &prior.related);
            self.update_kinds();
            tracing::debug!(policy = %id, "Policy deleted");
            self.send(Trigger::Deleted(id));
        }
    }

    // Since apply only reindexes a single policy at a time, there's no need
    // to handle resets specially.
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, resource: k8s::Namespace) {
        let name = resource.name_unchecked();
        let labels = resource.labels().clone();
        if self.namespaces.get(&name) == Some(&labels) {
            return;
        }
        self.namespaces.insert(name, labels);
        self.namespaces_changed();
    }

    fn delete(&mut self, name: String) {
        if self.namespaces.remove(&name).is_some() {
            self.namespaces_changed();
        }
    }
}

// === impl Policy ===

impl Policy {
    fn new(resource: ConfigurationPolicy) -> Self {
        let interests = resource
            .spec
            .object_templates
            .iter()
            .filter_map(Interest::from_template)
            .collect();
        let related = resource
            .status
            .iter()
            .flat_map(|s| s.related_objects.iter())
            .map(|r| ObjectId::from(&r.object))
            .collect();
        Self {
            generation: resource.metadata.generation,
            deleting: resource.metadata.deletion_timestamp.is_some(),
            interests,
            related,
            resource: Arc::new(resource),
        }
    }

    /// True if some template's targets depend on the namespace selector.
    fn selects_namespaces(&self) -> bool {
        self.interests.iter().any(|i| i.namespace.is_none())
    }
}

// === impl Interest ===

impl Interest {
    fn from_template(template: &ObjectTemplate) -> Option<Self> {
        let def = &template.object_definition;
        let api_version = def.get("apiVersion")?.as_str()?;
        let kind = def.get("kind")?.as_str()?;
        let field = |name: &str| {
            def.get("metadata")
                .and_then(|m| m.get(name))
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        Some(Self {
            kind: KindRef::new(api_version, kind),
            namespace: field("namespace"),
            name: field("name"),
        })
    }

    fn matches(&self, object: &ObjectId) -> bool {
        if self.kind.api_version != object.api_version || self.kind.kind != object.kind {
            return false;
        }
        if let Some(name) = &self.name {
            if *name != object.name {
                return false;
            }
        }
        match (&self.namespace, object.namespace()) {
            (Some(want), Some(ns)) => want == ns,
            _ => true,
        }
    }
}

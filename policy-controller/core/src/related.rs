use ahash::AHashSet;
use config_policy_controller_k8s_api::policy::{
    ObjectMetadata, ObjectProperties, ObjectResource, RelatedObject,
};
use std::collections::BTreeMap;

/// Identifies a related object. Ordered by namespace (cluster-scoped objects
/// first), then name, then kind, so that publication order is total.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub api_version: String,
}

/// The related objects built by a single evaluation pass.
#[derive(Clone, Debug, Default)]
pub struct RelatedObjects {
    entries: BTreeMap<ObjectId, RelatedObject>,
    observed_uids: BTreeMap<ObjectId, String>,
}

// === impl ObjectId ===

impl ObjectId {
    pub fn new(
        api_version: impl ToString,
        kind: impl ToString,
        namespace: Option<&str>,
        name: impl ToString,
    ) -> Self {
        Self {
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            api_version: api_version.to_string(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    pub fn to_resource(&self) -> ObjectResource {
        ObjectResource {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            metadata: ObjectMetadata {
                name: self.name.clone(),
                namespace: self.namespace().map(ToString::to_string),
            },
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

impl From<&ObjectResource> for ObjectId {
    fn from(obj: &ObjectResource) -> Self {
        Self::new(
            &obj.api_version,
            &obj.kind,
            obj.metadata.namespace.as_deref(),
            &obj.metadata.name,
        )
    }
}

// === impl RelatedObjects ===

impl RelatedObjects {
    /// Records an entry, replacing any entry with the same identity.
    pub fn add(&mut self, entry: RelatedObject) -> &RelatedObject {
        let id = ObjectId::from(&entry.object);
        self.observed_uids.remove(&id);
        self.entries.insert(id.clone(), entry);
        &self.entries[&id]
    }

    /// Records an entry for an object observed on the cluster. The UID is
    /// only used to recognize the object a prior pass created; it is not
    /// published unless the policy created the object.
    pub fn add_observed(&mut self, entry: RelatedObject, uid: Option<&str>) -> &RelatedObject {
        let id = ObjectId::from(&entry.object);
        match uid {
            Some(uid) => self.observed_uids.insert(id.clone(), uid.to_string()),
            None => self.observed_uids.remove(&id),
        };
        self.entries.insert(id.clone(), entry);
        &self.entries[&id]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&RelatedObject> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &RelatedObject)> {
        self.entries.iter()
    }

    /// Produces the list to publish in the policy status.
    ///
    /// Ownership recorded by a prior pass (`createdByPolicy` and `uid`) is
    /// carried forward to re-observed objects with the same UID. Prior entries
    /// of `kinds_to_keep` that this pass did not touch are kept as-is; all
    /// other prior entries are dropped.
    pub fn publish(
        mut self,
        prior: &[RelatedObject],
        kinds_to_keep: &AHashSet<(String, String)>,
    ) -> Vec<RelatedObject> {
        for old in prior {
            let id = ObjectId::from(&old.object);
            match self.entries.get_mut(&id) {
                Some(new) => carry_forward(new, old, self.observed_uids.get(&id)),
                None => {
                    let kind = (id.api_version.clone(), id.kind.clone());
                    if kinds_to_keep.contains(&kind) {
                        self.entries.insert(id, old.clone());
                    }
                }
            }
        }

        self.entries.into_values().collect()
    }
}

fn carry_forward(new: &mut RelatedObject, old: &RelatedObject, observed_uid: Option<&String>) {
    let (Some(props), Some(old_props)) = (new.properties.as_mut(), old.properties.as_ref()) else {
        return;
    };
    if old_props.created_by_policy != Some(true) {
        return;
    }

    let current_uid = props.uid.as_ref().or(observed_uid);
    let same_object = match (current_uid, &old_props.uid) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    };
    if !same_object {
        return;
    }

    props.created_by_policy = Some(true);
    if props.uid.is_none() {
        props.uid = old_props.uid.clone();
    }
}

pub(crate) fn properties(
    created_by_policy: bool,
    uid: Option<String>,
    diff: Option<String>,
) -> ObjectProperties {
    ObjectProperties {
        created_by_policy: Some(created_by_policy),
        uid,
        diff,
    }
}

use crate::{Index, KindRef, ResourceId, SharedIndex, Trigger};
use config_policy_controller_k8s_api::{self as k8s, ConfigurationPolicy};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

struct TestConfig {
    index: SharedIndex,
    triggers: mpsc::UnboundedReceiver<Trigger>,
}

impl TestConfig {
    fn new() -> Self {
        let (tx, triggers) = mpsc::unbounded_channel();
        Self {
            index: Index::shared(tx),
            triggers,
        }
    }

    fn apply_policy(&self, policy: ConfigurationPolicy) {
        IndexNamespacedResource::apply(&mut *self.index.write(), policy);
    }

    fn apply_namespace(&self, ns: k8s::Namespace) {
        IndexClusterResource::apply(&mut *self.index.write(), ns);
    }

    fn drain(&mut self) -> Vec<Trigger> {
        let mut triggers = vec![];
        while let Ok(t) = self.triggers.try_recv() {
            triggers.push(t);
        }
        triggers
    }
}

fn mk_policy(
    ns: &str,
    name: &str,
    generation: i64,
    templates: serde_json::Value,
    related: serde_json::Value,
) -> ConfigurationPolicy {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "policy.open-cluster-management.io/v1",
        "kind": "ConfigurationPolicy",
        "metadata": { "namespace": ns, "name": name, "generation": generation },
        "spec": { "object-templates": templates },
        "status": { "relatedObjects": related },
    }))
    .expect("policy must decode")
}

fn configmap_template(namespace: Option<&str>, name: Option<&str>) -> serde_json::Value {
    let mut metadata = serde_json::Map::new();
    if let Some(ns) = namespace {
        metadata.insert("namespace".into(), ns.into());
    }
    if let Some(name) = name {
        metadata.insert("name".into(), name.into());
    }
    serde_json::json!([{
        "complianceType": "musthave",
        "objectDefinition": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": metadata },
    }])
}

fn mk_namespace(name: &str, labels: k8s::labels::Map) -> k8s::Namespace {
    k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pid(name: &str) -> ResourceId {
    ResourceId::new("policies", name)
}

#[test]
fn new_policy_triggers_evaluation() {
    let mut test = TestConfig::new();
    test.apply_policy(mk_policy(
        "policies",
        "p",
        1,
        configmap_template(Some("default"), Some("cm")),
        serde_json::json!([]),
    ));
    assert_eq!(test.drain(), vec![Trigger::Spec(pid("p"))]);
    assert!(test.index.read().policy(&pid("p")).is_some());
}

#[test]
fn status_updates_do_not_retrigger() {
    let mut test = TestConfig::new();
    let templates = configmap_template(Some("default"), Some("cm"));
    test.apply_policy(mk_policy("policies", "p", 1, templates.clone(), serde_json::json!([])));
    test.drain();

    // Our own status write comes back with the same generation.
    test.apply_policy(mk_policy(
        "policies",
        "p",
        1,
        templates.clone(),
        serde_json::json!([{
            "object": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cm", "namespace": "default" } },
            "compliant": "Compliant",
            "reason": "Resource found as expected",
        }]),
    ));
    assert_eq!(test.drain(), vec![]);

    test.apply_policy(mk_policy("policies", "p", 2, templates, serde_json::json!([])));
    assert_eq!(test.drain(), vec![Trigger::Spec(pid("p"))]);
}

#[test]
fn deleted_policy_is_forgotten() {
    let mut test = TestConfig::new();
    test.apply_policy(mk_policy(
        "policies",
        "p",
        1,
        configmap_template(None, None),
        serde_json::json!([]),
    ));
    test.drain();

    IndexNamespacedResource::<ConfigurationPolicy>::delete(
        &mut *test.index.write(),
        "policies".to_string(),
        "p".to_string(),
    );
    assert_eq!(test.drain(), vec![Trigger::Deleted(pid("p"))]);
    assert!(test.index.read().policy(&pid("p")).is_none());
    assert!(test.index.read().watched_kinds().borrow().is_empty());

    // Deleting an unknown policy is a no-op.
    IndexNamespacedResource::<ConfigurationPolicy>::delete(
        &mut *test.index.write(),
        "policies".to_string(),
        "p".to_string(),
    );
    assert_eq!(test.drain(), vec![]);
}

#[test]
fn related_objects_trigger_their_policies() {
    let mut test = TestConfig::new();
    // The template names a different object; only the status links `old`.
    test.apply_policy(mk_policy(
        "policies",
        "p",
        1,
        configmap_template(Some("default"), Some("cm")),
        serde_json::json!([{
            "object": { "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "old", "namespace": "default" } },
            "compliant": "Compliant",
            "reason": "Resource found as expected",
        }]),
    ));
    test.drain();

    let kinds = test.index.read().watched_kinds().borrow().clone();
    assert_eq!(
        kinds.into_iter().collect::<Vec<_>>(),
        vec![KindRef::new("v1", "ConfigMap"), KindRef::new("v1", "Secret")]
    );

    test.index
        .write()
        .object_event("v1", "Secret", Some("default"), "old");
    assert_eq!(test.drain(), vec![Trigger::Watch(pid("p"))]);

    test.index
        .write()
        .object_event("v1", "Secret", Some("default"), "other");
    assert_eq!(test.drain(), vec![]);
}

#[test]
fn template_interest_narrows_by_name_and_namespace() {
    let mut test = TestConfig::new();
    test.apply_policy(mk_policy(
        "policies",
        "named",
        1,
        configmap_template(Some("default"), Some("cm")),
        serde_json::json!([]),
    ));
    test.apply_policy(mk_policy(
        "policies",
        "any",
        1,
        configmap_template(None, None),
        serde_json::json!([]),
    ));
    test.drain();

    test.index
        .write()
        .object_event("v1", "ConfigMap", Some("default"), "cm");
    assert_eq!(
        test.drain(),
        vec![Trigger::Watch(pid("any")), Trigger::Watch(pid("named"))]
    );

    test.index
        .write()
        .object_event("v1", "ConfigMap", Some("other"), "cm");
    assert_eq!(test.drain(), vec![Trigger::Watch(pid("any"))]);

    test.index
        .write()
        .object_event("apps/v1", "Deployment", Some("default"), "cm");
    assert_eq!(test.drain(), vec![]);
}

#[test]
fn namespace_changes_trigger_selecting_policies() {
    let mut test = TestConfig::new();
    test.apply_policy(mk_policy(
        "policies",
        "pinned",
        1,
        configmap_template(Some("default"), Some("cm")),
        serde_json::json!([]),
    ));
    test.apply_policy(mk_policy(
        "policies",
        "selecting",
        1,
        configmap_template(None, Some("cm")),
        serde_json::json!([]),
    ));
    test.drain();

    test.apply_namespace(mk_namespace("default", btreemap! { "env".into() => "dev".into() }));
    assert_eq!(test.drain(), vec![Trigger::Watch(pid("selecting"))]);

    // Unchanged labels are ignored.
    test.apply_namespace(mk_namespace("default", btreemap! { "env".into() => "dev".into() }));
    assert_eq!(test.drain(), vec![]);

    test.apply_namespace(mk_namespace("default", btreemap! { "env".into() => "prod".into() }));
    assert_eq!(test.drain(), vec![Trigger::Watch(pid("selecting"))]);

    IndexClusterResource::<k8s::Namespace>::delete(&mut *test.index.write(), "default".into());
    assert_eq!(test.drain(), vec![Trigger::Watch(pid("selecting"))]);
}

#[test]
fn namespaces_are_sorted() {
    let test = TestConfig::new();
    test.apply_namespace(mk_namespace("kube-system", Default::default()));
    test.apply_namespace(mk_namespace("default", btreemap! { "a".into() => "b".into() }));

    let namespaces = test.index.read().namespaces();
    assert_eq!(
        namespaces.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
        vec!["default", "kube-system"]
    );
    assert_eq!(namespaces[0].labels, btreemap! { "a".into() => "b".into() });
}

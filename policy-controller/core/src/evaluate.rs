//! A single evaluation pass of a `ConfigurationPolicy`.
//!
//! The pass reads everything it needs from a [`Store`], enforces the policy
//! when asked to, and returns the status to publish. It never publishes a
//! partial result: a transient store failure aborts the whole pass.

use crate::{
    compliance::{Outcome, TemplateTally, Verdict},
    merge::{self, without_nulls},
    related::{self, ObjectId, RelatedObjects},
    selector::NamespaceTarget,
    store::{self, KindInfo, NamespaceInfo, Store, StoreError},
    value::{Map, Value},
};
use ahash::AHashSet;
use chrono::{SecondsFormat, Utc};
use config_policy_controller_k8s_api::{
    labels::Selector,
    policy::{ObjectProperties, RecordDiff, TemplateStatus, PRUNE_FINALIZER},
    ComplianceState, ComplianceType, ConfigurationPolicy, ConfigurationPolicyStatus,
    ObjectTemplate, PruneObjectBehavior, RelatedObject, RemediationAction, ResourceExt,
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The store failed in a way that may succeed on retry. Nothing from the
    /// pass may be published.
    #[error("policy evaluation failed: {0}")]
    Transient(#[source] StoreError),
}

/// The outcome of an evaluation pass.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub status: ConfigurationPolicyStatus,
    pub diffs: Vec<ObjectDiff>,
}

/// The difference between an object and its template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDiff {
    pub object: ObjectId,
    pub diff: String,
}

/// Errors that determine a template's status rather than failing the pass.
#[derive(Debug, thiserror::Error)]
enum TemplateError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Pass<'a, S: ?Sized> {
    store: &'a S,
    policy: &'a ConfigurationPolicy,
    prior: &'a ConfigurationPolicyStatus,
    enforce: bool,
    namespaces: Option<Vec<NamespaceInfo>>,
    related: RelatedObjects,
    kinds_to_keep: AHashSet<(String, String)>,
    diffs: Vec<ObjectDiff>,
}

/// One object template, resolved against the cluster.
struct Target<'t> {
    index: usize,
    template: &'t ObjectTemplate,
    kind: &'t KindInfo,
    desired: &'t Value,
    namespace: Option<&'t str>,
}

/// What was found for one object, for the related object list.
struct Found<'o> {
    outcome: Outcome,
    reason: &'static str,
    uid: Option<&'o str>,
    created: bool,
    diff: Option<String>,
}

/// Evaluates a policy against the store, returning the status to publish.
///
/// Enforcing policies create, update and delete objects in the store. When
/// the policy is being deleted, the objects it manages are pruned instead.
#[instrument(skip_all, fields(ns = %policy.namespace().unwrap_or_default(), name = %policy.name_any()))]
pub async fn evaluate<S>(store: &S, policy: &ConfigurationPolicy) -> Result<Evaluation, EvalError>
where
    S: Store + ?Sized,
{
    let prior = policy.status.clone().unwrap_or_default();
    if policy.metadata.deletion_timestamp.is_some() {
        return prune(store, policy, prior).await;
    }

    sync_finalizer(store, policy).await?;

    let mut pass = Pass {
        store,
        policy,
        prior: &prior,
        enforce: policy.spec.remediation_action == RemediationAction::Enforce,
        namespaces: None,
        related: RelatedObjects::default(),
        kinds_to_keep: AHashSet::default(),
        diffs: Vec::new(),
    };

    let mut details = Vec::with_capacity(policy.spec.object_templates.len());
    for (index, template) in policy.spec.object_templates.iter().enumerate() {
        let status = match pass.template(index, template).await {
            Ok(status) => status,
            Err(TemplateError::Store(error)) if error.is_transient() => {
                return Err(EvalError::Transient(error));
            }
            Err(error) => {
                debug!(index, %error, "Template could not be evaluated");
                TemplateStatus {
                    compliant: ComplianceState::NonCompliant,
                    message: error.to_string(),
                }
            }
        };
        details.push(status);
    }

    let verdict = Verdict::aggregate(details);
    debug!(state = %verdict.state, message = %verdict.message, "Evaluated");
    let Pass {
        related,
        kinds_to_keep,
        diffs,
        ..
    } = pass;

    Ok(Evaluation {
        status: ConfigurationPolicyStatus {
            compliant: Some(verdict.state),
            message: Some(verdict.message),
            compliancy_details: verdict.details,
            related_objects: related.publish(&prior.related_objects, &kinds_to_keep),
            last_evaluated: Some(now()),
            last_evaluated_generation: policy.metadata.generation,
        },
        diffs,
    })
}

/// Returns true if `next` differs from `prior` in anything but its
/// evaluation timestamp.
pub fn status_changed(
    prior: Option<&ConfigurationPolicyStatus>,
    next: &ConfigurationPolicyStatus,
) -> bool {
    let Some(prior) = prior else {
        return true;
    };
    let content = |s: &ConfigurationPolicyStatus| ConfigurationPolicyStatus {
        last_evaluated: None,
        ..s.clone()
    };
    content(prior) != content(next)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn transient(error: StoreError) -> Result<(), EvalError> {
    if error.is_transient() {
        return Err(EvalError::Transient(error));
    }
    Ok(())
}

/// Adds or removes the pruning finalizer to match the policy's spec.
async fn sync_finalizer<S>(store: &S, policy: &ConfigurationPolicy) -> Result<(), EvalError>
where
    S: Store + ?Sized,
{
    let wanted = policy.spec.prunes_objects();
    let finalizers = policy.finalizers();
    if finalizers.iter().any(|f| f == PRUNE_FINALIZER) == wanted {
        return Ok(());
    }

    let mut next = finalizers
        .iter()
        .filter(|f| *f != PRUNE_FINALIZER)
        .cloned()
        .collect::<Vec<_>>();
    if wanted {
        next.push(PRUNE_FINALIZER.to_string());
    }

    let ns = policy.namespace().unwrap_or_default();
    if let Err(error) = store
        .set_policy_finalizers(&ns, &policy.name_any(), next)
        .await
    {
        warn!(%error, "Failed to update policy finalizers");
        transient(error)?;
    }
    Ok(())
}

/// Deletes the objects a deleted policy manages, then releases the policy.
async fn prune<S>(
    store: &S,
    policy: &ConfigurationPolicy,
    prior: ConfigurationPolicyStatus,
) -> Result<Evaluation, EvalError>
where
    S: Store + ?Sized,
{
    let done = Evaluation {
        status: prior.clone(),
        diffs: Vec::new(),
    };
    if !policy.finalizers().iter().any(|f| f == PRUNE_FINALIZER) {
        return Ok(done);
    }

    let mut remaining = RelatedObjects::default();
    if policy.spec.prunes_objects() {
        for entry in prior.related_objects.iter() {
            let created = entry
                .properties
                .as_ref()
                .and_then(|p| p.created_by_policy)
                .unwrap_or(false);
            if policy.spec.prune_object_behavior == PruneObjectBehavior::DeleteIfCreated
                && !created
            {
                continue;
            }

            let id = ObjectId::from(&entry.object);
            let kind = match store.resolve_kind(&id.api_version, &id.kind).await {
                Ok(Some(kind)) => kind,
                Ok(None) => continue,
                Err(error) => {
                    transient(error)?;
                    continue;
                }
            };
            if let Err(error) = store.delete(&kind, id.namespace(), &id.name).await {
                warn!(object = %id, %error, "Failed to delete related object");
                transient(error)?;
            }
            match store.get(&kind, id.namespace(), &id.name).await {
                Ok(None) => info!(object = %id, "Deleted related object"),
                Ok(Some(_)) => {
                    remaining.add(RelatedObject {
                        compliant: ComplianceState::Terminating,
                        reason: Outcome::Pending.reason().to_string(),
                        ..entry.clone()
                    });
                }
                Err(error) => {
                    transient(error)?;
                }
            }
        }
    }

    if remaining.is_empty() {
        let next = policy
            .finalizers()
            .iter()
            .filter(|f| *f != PRUNE_FINALIZER)
            .cloned()
            .collect();
        let ns = policy.namespace().unwrap_or_default();
        if let Err(error) = store.set_policy_finalizers(&ns, &policy.name_any(), next).await {
            transient(error)?;
        }
        return Ok(done);
    }

    let message = format!(
        "Waiting for {} related object(s) to be deleted",
        remaining.len()
    );
    Ok(Evaluation {
        status: ConfigurationPolicyStatus {
            compliant: Some(ComplianceState::Terminating),
            message: Some(message),
            compliancy_details: prior.compliancy_details.clone(),
            related_objects: remaining.publish(&[], &AHashSet::default()),
            last_evaluated: Some(now()),
            last_evaluated_generation: policy.metadata.generation,
        },
        diffs: Vec::new(),
    })
}

// === impl Pass ===

impl<S> Pass<'_, S>
where
    S: Store + ?Sized,
{
    async fn template(
        &mut self,
        index: usize,
        template: &ObjectTemplate,
    ) -> Result<TemplateStatus, TemplateError> {
        let desired = Value::from(template.object_definition.clone());
        let (Some(api_version), Some(kind)) =
            (desired.str_at(&["apiVersion"]), desired.str_at(&["kind"]))
        else {
            return Err(TemplateError::Invalid(format!(
                "The object-template at index [{index}] must specify both apiVersion and kind"
            )));
        };
        let info = self
            .store
            .resolve_kind(api_version, kind)
            .await?
            .ok_or_else(|| {
                TemplateError::Invalid(format!(
                    "couldn't find mapping resource with kind {kind}, please check if you have CRD deployed"
                ))
            })?;

        let name = desired
            .str_at(&["metadata", "name"])
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        // A name always takes precedence over the object selector.
        let selector = match (&name, &template.object_selector) {
            (None, Some(raw)) => match Selector::try_from(raw) {
                Ok(selector) => Some(selector),
                Err(error) => {
                    self.kinds_to_keep
                        .insert((info.api_version.clone(), info.kind.clone()));
                    let compliant = self
                        .prior
                        .compliancy_details
                        .get(index)
                        .map(|d| d.compliant)
                        .unwrap_or(ComplianceState::NonCompliant);
                    return Ok(TemplateStatus {
                        compliant,
                        message: format!(
                            "Error parsing provided objectSelector in the object-template at index [{index}]: {error}"
                        ),
                    });
                }
            },
            _ => None,
        };

        let namespaces = self.target_namespaces(&info, &desired).await?;
        let mut tally = TemplateTally::new(&info.kind, &info.plural, template.compliance_type);
        let mut selected = 0;
        for namespace in namespaces.iter().map(Option::as_deref) {
            let target = Target {
                index,
                template,
                kind: &info,
                desired: &desired,
                namespace,
            };
            match (&name, &selector) {
                (Some(name), _) => {
                    let observed = self.store.get(&info, namespace, name).await?;
                    self.object(&mut tally, &target, name, observed, false)
                        .await?;
                }
                (None, Some(selector)) => {
                    let objects = self.store.list(&info, namespace, Some(selector)).await?;
                    selected += objects.len();
                    for observed in objects {
                        let Some(name) = store::name_of(&observed).map(str::to_string) else {
                            continue;
                        };
                        self.object(&mut tally, &target, &name, Some(observed), true)
                            .await?;
                    }
                }
                (None, None) => self.unnamed(&mut tally, &target).await?,
            }
        }
        if selector.is_some() && selected == 0 {
            tally.record_no_selector_match();
        }

        Ok(tally.status())
    }

    async fn target_namespaces(
        &mut self,
        kind: &KindInfo,
        desired: &Value,
    ) -> Result<Vec<Option<String>>, TemplateError> {
        if !kind.namespaced {
            return Ok(vec![None]);
        }
        if let Some(ns) = desired
            .str_at(&["metadata", "namespace"])
            .filter(|ns| !ns.is_empty())
        {
            return Ok(vec![Some(ns.to_string())]);
        }

        let target = NamespaceTarget::new(&self.policy.spec.namespace_selector)
            .map_err(|e| TemplateError::Invalid(e.to_string()))?;
        if self.namespaces.is_none() {
            // Namespaces are read once so that every template sees the same set.
            self.namespaces = Some(self.store.namespaces().await?);
        }
        let names = target.resolve(
            self.namespaces
                .iter()
                .flatten()
                .map(|ns| (ns.name.as_str(), &ns.labels)),
        );
        if names.is_empty() {
            return Err(TemplateError::Invalid(format!(
                "namespaced object of kind {} has no namespace specified from the policy namespaceSelector nor the object metadata",
                kind.kind
            )));
        }
        Ok(names.into_iter().map(Some).collect())
    }

    /// Evaluates a template without a name or object selector: every object
    /// of the kind that satisfies the template counts as a match.
    async fn unnamed(
        &mut self,
        tally: &mut TemplateTally,
        target: &Target<'_>,
    ) -> Result<(), TemplateError> {
        let matching = self
            .store
            .list(target.kind, target.namespace, None)
            .await?
            .into_iter()
            .filter(|o| merge::compare_object(target.desired, o, ComplianceType::MustHave).compliant)
            .collect::<Vec<_>>();
        if matching.is_empty() {
            tally.record_none(target.namespace);
            return Ok(());
        }

        for observed in matching {
            let Some(name) = store::name_of(&observed).map(str::to_string) else {
                continue;
            };
            self.object(tally, target, &name, Some(observed), true).await?;
        }
        Ok(())
    }

    /// Evaluates a single object. `selected` is true when the object was found
    /// by listing rather than by name.
    async fn object(
        &mut self,
        tally: &mut TemplateTally,
        target: &Target<'_>,
        name: &str,
        observed: Option<Value>,
        selected: bool,
    ) -> Result<(), TemplateError> {
        let Target {
            template,
            kind,
            desired,
            namespace: ns,
            ..
        } = *target;
        let id = ObjectId::new(&kind.api_version, &kind.kind, ns, name);

        match (template.compliance_type, observed) {
            (ComplianceType::MustNotHave, None) => {
                self.record(tally, id, Found::new(Outcome::Absent));
            }

            (ComplianceType::MustNotHave, Some(observed)) => {
                // Listed objects are only violations when they match the template.
                if selected
                    && !merge::compare_object(desired, &observed, ComplianceType::MustHave)
                        .compliant
                {
                    return Ok(());
                }
                let uid = store::uid_of(&observed).map(str::to_string);
                if !self.enforce {
                    let found = Found::new(Outcome::Present).uid(uid.as_deref());
                    self.record(tally, id, found);
                    return Ok(());
                }

                if !store::is_deleting(&observed) {
                    self.store.delete(kind, ns, name).await?;
                    info!(object = %id, "Deleted object");
                }
                let found = match self.store.get(kind, ns, name).await? {
                    None => Found::new(Outcome::Absent).reason("K8s deletion success"),
                    Some(o) if store::is_deleting(&o) => Found::new(Outcome::Pending),
                    Some(_) => Found::new(Outcome::Present),
                };
                self.record(tally, id, found.uid(uid.as_deref()));
            }

            (_, None) => {
                if !self.enforce {
                    self.record(tally, id, Found::new(Outcome::Missing));
                    return Ok(());
                }
                let object = creation_document(desired, name, kind.namespaced.then_some(ns).flatten());
                let created = self.store.create(kind, ns, object).await?;
                info!(object = %id, "Created object");
                let found = Found::new(Outcome::Matched)
                    .reason("K8s creation success")
                    .created()
                    .uid(store::uid_of(&created));
                self.record(tally, id, found);
            }

            (mode, Some(observed)) => {
                let cmp = merge::compare_object(desired, &observed, mode);
                let uid = store::uid_of(&observed);
                if cmp.compliant {
                    self.record(tally, id, Found::new(Outcome::Matched).uid(uid));
                    return Ok(());
                }

                let diff = self.note_diff(target.index, &id, template.record_diff, &cmp.diffs);
                if !self.enforce {
                    let found = Found::new(Outcome::Mismatched).uid(uid).diff(diff);
                    self.record(tally, id, found);
                    return Ok(());
                }
                let updated = self.store.update(kind, ns, cmp.merged).await?;
                info!(object = %id, "Updated object");
                let found = Found::new(Outcome::Matched)
                    .reason("K8s update success")
                    .uid(store::uid_of(&updated))
                    .diff(diff);
                self.record(tally, id, found);
            }
        }
        Ok(())
    }

    /// Records an object's outcome in the template tally and the related
    /// objects.
    fn record(&mut self, tally: &mut TemplateTally, id: ObjectId, found: Found<'_>) {
        tally.record(id.namespace(), &id.name, found.outcome);

        // Ownership properties are only meaningful when the policy writes,
        // and the UID only identifies objects the policy created.
        let properties = if self.enforce {
            let uid = found.uid.filter(|_| found.created).map(str::to_string);
            Some(related::properties(found.created, uid, found.diff))
        } else {
            found.diff.map(|diff| ObjectProperties {
                diff: Some(diff),
                ..Default::default()
            })
        };

        self.related.add_observed(
            RelatedObject {
                object: id.to_resource(),
                compliant: found.outcome.state(),
                reason: found.reason.to_string(),
                properties,
            },
            found.uid,
        );
    }

    /// Keeps a diff for the caller and, depending on `recordDiff`, logs it.
    /// Returns the diff if it belongs in the status.
    fn note_diff(
        &mut self,
        index: usize,
        id: &ObjectId,
        record: Option<RecordDiff>,
        diffs: &[merge::Difference],
    ) -> Option<String> {
        let diff = merge::describe(diffs);
        self.diffs.push(ObjectDiff {
            object: id.clone(),
            diff: diff.clone(),
        });
        match record {
            Some(RecordDiff::Log) => {
                info!(object = %id, template = index, "Object differs from template:\n{diff}");
                None
            }
            Some(RecordDiff::InStatus) => Some(diff),
            Some(RecordDiff::None) | None => None,
        }
    }
}

// === impl Found ===

impl<'o> Found<'o> {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            reason: outcome.reason(),
            uid: None,
            created: false,
            diff: None,
        }
    }

    fn reason(self, reason: &'static str) -> Self {
        Self { reason, ..self }
    }

    fn uid(self, uid: Option<&'o str>) -> Self {
        Self { uid, ..self }
    }

    fn created(self) -> Self {
        Self {
            created: true,
            ..self
        }
    }

    fn diff(self, diff: Option<String>) -> Self {
        Self { diff, ..self }
    }
}

/// Builds the object to create from a template.
fn creation_document(desired: &Value, name: &str, namespace: Option<&str>) -> Value {
    let mut object = without_nulls(desired);
    if let Some(obj) = object.as_map_mut() {
        let meta = obj
            .entry("metadata".to_string())
            .or_insert_with(|| Value::Map(Map::new()));
        if let Some(meta) = meta.as_map_mut() {
            meta.insert("name".to_string(), Value::from(name));
            if let Some(ns) = namespace {
                meta.insert("namespace".to_string(), Value::from(ns));
            }
        }
    }
    object
}

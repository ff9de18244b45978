//! Evaluates a policy against cluster state read from files.
//!
//! Nothing is read from or written to a cluster. Enforcing policies mutate
//! the in-memory snapshot only. The `generate` subcommand is the exception:
//! it reads the API mappings a cluster serves so that later dry runs can
//! resolve custom resources.

use crate::{
    core::{evaluate, Evaluation, KindInfo, MemoryStore, Value},
    k8s::{ComplianceState, ConfigurationPolicy, Resource},
};
use anyhow::{bail, Context, Result};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, info};

/// The exit code reported when the policy is not compliant.
pub const NONCOMPLIANT: u8 = 2;

#[derive(Debug, clap::Args)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
pub struct Args {
    /// The Policy or ConfigurationPolicy to evaluate. A Policy must wrap a
    /// ConfigurationPolicy in its `policy-templates`.
    #[clap(short = 'p', long, required = true)]
    policy: Option<PathBuf>,

    /// YAML files describing the cluster state. Files may hold several
    /// documents and `List` objects.
    cluster_state: Vec<PathBuf>,

    /// Writes the compliance message to this file instead of stdout.
    #[clap(long)]
    messages_path: Option<PathBuf>,

    /// Writes the resulting policy status to this file as YAML.
    #[clap(long)]
    status_path: Option<PathBuf>,

    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    print_diffs: bool,

    /// API mappings used to resolve kinds, as written by `generate`. Needed
    /// for custom resources.
    #[clap(long, env = "DRYRUN_MAPPINGS_FILE")]
    mappings_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Discovers the API resources a cluster serves and writes them as a
    /// mappings file.
    Generate(Generate),
}

#[derive(Debug, clap::Args)]
struct Generate {
    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Writes the mappings to this file instead of stdout.
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,
}

/// How a kind is served, as recorded in a mappings file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Mapping {
    api_version: String,
    kind: String,
    plural: String,
    namespaced: bool,
}

impl Args {
    /// Returns the process exit code.
    pub async fn run(self) -> Result<u8> {
        if let Some(Command::Generate(generate)) = self.command {
            generate.run().await?;
            return Ok(0);
        }

        let Some(policy_path) = &self.policy else {
            bail!("--policy is required");
        };
        let policy = load_policy(policy_path).await?;

        let store = MemoryStore::new();
        if let Some(path) = &self.mappings_file {
            let mappings = load_mappings(path).await?;
            debug!(mappings = mappings.len(), "Loaded API mappings");
            for mapping in mappings {
                store.register(mapping.into());
            }
        }
        for path in &self.cluster_state {
            let text = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let objects =
                parse_objects(&text).with_context(|| format!("parsing {}", path.display()))?;
            for object in objects {
                store
                    .insert(object)
                    .with_context(|| format!("loading {}", path.display()))?;
            }
        }
        debug!(objects = store.objects().len(), "Loaded cluster state");

        let evaluation = evaluate(&store, &policy).await?;

        let mut out = String::new();
        if self.print_diffs {
            out.push_str(&diffs(&evaluation));
        }
        let messages = messages(&evaluation);
        match &self.messages_path {
            Some(path) => fs::write(path, &messages)
                .await
                .with_context(|| format!("writing {}", path.display()))?,
            None => out.push_str(&messages),
        }
        print!("{out}");

        if let Some(path) = &self.status_path {
            let status = serde_yaml::to_string(&evaluation.status)?;
            fs::write(path, status)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }

        if evaluation.status.compliant == Some(ComplianceState::NonCompliant) {
            return Ok(NONCOMPLIANT);
        }
        Ok(0)
    }
}

// === impl Generate ===

impl Generate {
    async fn run(self) -> Result<()> {
        let client = self.client.try_client().await?;
        let discovery = Discovery::new(client)
            .run()
            .await
            .context("discovering API resources")?;

        let mut mappings = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .map(|(resource, caps)| Mapping::discovered(&resource, &caps))
            .collect::<Vec<_>>();
        mappings.sort_by(|a, b| (&a.api_version, &a.kind).cmp(&(&b.api_version, &b.kind)));
        info!(mappings = mappings.len(), "Discovered API resources");

        let json = serde_json::to_string_pretty(&mappings)?;
        match &self.output {
            Some(path) => fs::write(path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?,
            None => println!("{json}"),
        }
        Ok(())
    }
}

// === impl Mapping ===

impl Mapping {
    fn discovered(resource: &ApiResource, caps: &ApiCapabilities) -> Self {
        Self {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            plural: resource.plural.clone(),
            namespaced: matches!(caps.scope, Scope::Namespaced),
        }
    }
}

impl From<Mapping> for KindInfo {
    fn from(m: Mapping) -> Self {
        KindInfo::new(&m.api_version, &m.kind, &m.plural, m.namespaced)
    }
}

/// Reads a mappings file. JSON files parse as YAML.
async fn load_mappings(path: &Path) -> Result<Vec<Mapping>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn load_policy(path: &Path) -> Result<ConfigurationPolicy> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let doc = serde_yaml::from_str::<serde_json::Value>(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    let (doc, namespace) =
        unwrap_policy(doc).with_context(|| format!("loading {}", path.display()))?;

    let mut policy = serde_json::from_value::<ConfigurationPolicy>(doc)
        .with_context(|| format!("parsing {}", path.display()))?;
    if policy.metadata.name.is_none() {
        bail!("{} has no metadata.name", path.display());
    }
    policy
        .metadata
        .namespace
        .get_or_insert_with(|| namespace.unwrap_or_else(|| "default".to_string()));
    Ok(policy)
}

/// Extracts the ConfigurationPolicy from a `Policy` wrapper, returning it
/// with the wrapper's namespace. Other documents are returned as-is.
fn unwrap_policy(doc: serde_json::Value) -> Result<(serde_json::Value, Option<String>)> {
    let api_version = ConfigurationPolicy::api_version(&());
    let is_wrapper = doc.get("kind").and_then(|k| k.as_str()) == Some("Policy")
        && doc.get("apiVersion").and_then(|v| v.as_str()) == Some(&*api_version);
    if !is_wrapper {
        return Ok((doc, None));
    }

    let namespace = doc
        .pointer("/metadata/namespace")
        .and_then(|ns| ns.as_str())
        .map(str::to_string);
    let templates = doc
        .pointer("/spec/policy-templates")
        .and_then(|t| t.as_array())
        .into_iter()
        .flatten();
    for template in templates {
        let Some(definition) = template.get("objectDefinition") else {
            continue;
        };
        let kind = definition.get("kind").and_then(|k| k.as_str());
        if kind == Some(&*ConfigurationPolicy::kind(&())) {
            return Ok((definition.clone(), namespace));
        }
    }
    bail!("the Policy has no ConfigurationPolicy template")
}

/// Reads every object from a multi-document YAML stream, flattening lists.
fn parse_objects(text: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let doc = serde_json::Value::deserialize(doc)?;
        match doc {
            serde_json::Value::Null => {}
            serde_json::Value::Object(ref obj)
                if obj.get("kind").and_then(|k| k.as_str()) == Some("List") =>
            {
                let items = obj.get("items").and_then(|i| i.as_array());
                for item in items.into_iter().flatten() {
                    objects.push(Value::from(item.clone()));
                }
            }
            serde_json::Value::Object(_) => objects.push(Value::from(doc)),
            other => bail!("expected an object, found {other}"),
        }
    }
    Ok(objects)
}

fn diffs(evaluation: &Evaluation) -> String {
    let mut out = String::from("# Diffs:\n");
    for diff in &evaluation.diffs {
        let _ = writeln!(out, "{} {}:", diff.object.api_version, diff.object);
        out.push_str(&diff.diff);
        if !diff.diff.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn messages(evaluation: &Evaluation) -> String {
    let message = evaluation.status.message.as_deref().unwrap_or_default();
    format!("# Compliance messages:\n{message}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const POLICY: &str = r#"
apiVersion: policy.open-cluster-management.io/v1
kind: ConfigurationPolicy
metadata:
  name: p
spec:
  remediationAction: inform
  object-templates:
    - complianceType: musthave
      objectDefinition:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: cm
          namespace: default
        data:
          a: b
"#;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    fn args(dir: &Path, state: &str) -> Args {
        Args {
            policy: Some(write(dir, "policy.yaml", POLICY)),
            cluster_state: vec![write(dir, "state.yaml", state)],
            messages_path: Some(dir.join("messages.txt")),
            status_path: Some(dir.join("status.yaml")),
            print_diffs: false,
            mappings_file: None,
            command: None,
        }
    }

    #[test]
    fn parses_documents_and_lists() {
        let objects = parse_objects(
            r#"
---
apiVersion: v1
kind: ConfigMap
metadata: { name: a, namespace: default }
---
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata: { name: b, namespace: default }
  - apiVersion: v1
    kind: Secret
    metadata: { name: c, namespace: default }
"#,
        )
        .unwrap();
        let names = objects
            .iter()
            .map(|o| o.str_at(&["metadata", "name"]).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn rejects_scalar_documents() {
        assert!(parse_objects("just a string").is_err());
    }

    #[tokio::test]
    async fn noncompliant_state_exits_with_two() {
        let dir = tempfile::tempdir().unwrap();
        let state = r#"
apiVersion: v1
kind: ConfigMap
metadata: { name: cm, namespace: default }
data: { a: c }
"#;
        let args = args(dir.path(), state);
        let code = args.run().await.unwrap();
        assert_eq!(code, NONCOMPLIANT);

        let messages = std::fs::read_to_string(dir.path().join("messages.txt")).unwrap();
        assert_eq!(
            messages,
            "# Compliance messages:\n\
             configmaps [cm] found but not as specified in namespace default\n"
        );
        let status = std::fs::read_to_string(dir.path().join("status.yaml")).unwrap();
        assert!(status.contains("compliant: NonCompliant"), "{status}");
    }

    #[tokio::test]
    async fn compliant_state_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let state = r#"
apiVersion: v1
kind: ConfigMap
metadata: { name: cm, namespace: default }
data: { a: b }
"#;
        let code = args(dir.path(), state).run().await.unwrap();
        assert_eq!(code, 0);

        let messages = std::fs::read_to_string(dir.path().join("messages.txt")).unwrap();
        assert!(messages.contains("found as specified"), "{messages}");
    }

    #[tokio::test]
    async fn policies_need_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "policy.yaml",
            "apiVersion: policy.open-cluster-management.io/v1\n\
             kind: ConfigurationPolicy\n\
             metadata: {}\n\
             spec: { object-templates: [] }\n",
        );
        assert!(load_policy(&path).await.is_err());
    }

    #[tokio::test]
    async fn policy_wrappers_are_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "policy.yaml",
            r#"
apiVersion: policy.open-cluster-management.io/v1
kind: Policy
metadata:
  name: parent
  namespace: policies
spec:
  policy-templates:
    - objectDefinition:
        apiVersion: policy.open-cluster-management.io/v1
        kind: CertificatePolicy
        metadata: { name: certs }
        spec: {}
    - objectDefinition:
        apiVersion: policy.open-cluster-management.io/v1
        kind: ConfigurationPolicy
        metadata: { name: configs }
        spec:
          remediationAction: inform
          object-templates: []
"#,
        );
        let policy = load_policy(&path).await.unwrap();
        assert_eq!(policy.metadata.name.as_deref(), Some("configs"));
        assert_eq!(policy.metadata.namespace.as_deref(), Some("policies"));
    }

    #[tokio::test]
    async fn policy_wrappers_need_a_configuration_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "policy.yaml",
            "apiVersion: policy.open-cluster-management.io/v1\n\
             kind: Policy\n\
             metadata: { name: parent }\n\
             spec: { policy-templates: [] }\n",
        );
        let error = load_policy(&path).await.unwrap_err();
        assert!(
            format!("{error:#}").contains("no ConfigurationPolicy template"),
            "{error:#}"
        );
    }

    #[tokio::test]
    async fn mappings_resolve_custom_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let policy = write(
            dir.path(),
            "policy.yaml",
            r#"
apiVersion: policy.open-cluster-management.io/v1
kind: ConfigurationPolicy
metadata: { name: p }
spec:
  remediationAction: inform
  object-templates:
    - complianceType: musthave
      objectDefinition:
        apiVersion: example.com/v1
        kind: Widget
        metadata: { name: w, namespace: default }
"#,
        );
        let mappings = write(
            dir.path(),
            "mappings.json",
            r#"[{"apiVersion": "example.com/v1", "kind": "Widget", "plural": "widgetries", "namespaced": true}]"#,
        );
        let run = |mappings_file: Option<PathBuf>| Args {
            policy: Some(policy.clone()),
            cluster_state: vec![],
            messages_path: Some(dir.path().join("messages.txt")),
            status_path: None,
            print_diffs: false,
            mappings_file,
            command: None,
        };
        let messages = || std::fs::read_to_string(dir.path().join("messages.txt")).unwrap();

        assert_eq!(run(None).run().await.unwrap(), NONCOMPLIANT);
        assert!(
            messages().contains("couldn't find mapping resource with kind Widget"),
            "{}",
            messages()
        );

        assert_eq!(run(Some(mappings)).run().await.unwrap(), NONCOMPLIANT);
        assert_eq!(
            messages(),
            "# Compliance messages:\nwidgetries [w] not found in namespace default\n"
        );
    }

    #[test]
    fn mappings_convert_to_kinds() {
        let mappings: Vec<Mapping> = serde_yaml::from_str(
            "- { apiVersion: example.com/v1, kind: Gadget, plural: gadgets, namespaced: false }",
        )
        .unwrap();
        let kinds = mappings.into_iter().map(KindInfo::from).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [KindInfo::new("example.com/v1", "Gadget", "gadgets", false)]
        );
    }
}

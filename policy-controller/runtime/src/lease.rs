//! Leader election over a `coordination.k8s.io/v1` Lease.

use crate::{
    k8s::{self, api::apps::v1::Deployment, ObjectMeta, OwnerReference, Resource},
    status::Leadership,
};
use anyhow::{Context, Result};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Patch, PatchParams};
use std::collections::BTreeMap;
use tokio::time::Duration;
use tracing::{debug, info};

const LEASE_NAME: &str = "config-policy-controller";

const CLAIM: kubert::lease::ClaimParams = kubert::lease::ClaimParams {
    lease_duration: Duration::from_secs(30),
    renew_grace_period: Duration::from_secs(1),
};

/// Joins the election for the controller's Lease and returns a handle that
/// tracks whether this replica currently holds it.
pub async fn elect(
    client: k8s::Client,
    namespace: &str,
    deployment: &str,
    hostname: &str,
) -> Result<Leadership> {
    let owner = deployment_owner(client.clone(), namespace, deployment).await?;
    let api = k8s::Api::<Lease>::namespaced(client, namespace);
    ensure_lease(&api, lease_for(namespace, deployment, owner)).await?;

    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, CLAIM)
        .await?;
    info!(lease = LEASE_NAME, %hostname, "Joined leader election");
    Ok(Leadership::elected(claims, hostname))
}

/// The Lease is owned by the controller's Deployment so that it's removed
/// along with it.
async fn deployment_owner(
    client: k8s::Client,
    namespace: &str,
    name: &str,
) -> Result<OwnerReference> {
    let deployment = k8s::Api::<Deployment>::namespaced(client, namespace)
        .get(name)
        .await
        .with_context(|| format!("failed to fetch deployment {namespace}/{name}"))?;
    deployment
        .controller_owner_ref(&())
        .with_context(|| format!("deployment {namespace}/{name} has no name or uid"))
}

fn lease_for(namespace: &str, deployment: &str, owner: OwnerReference) -> Lease {
    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            deployment.to_string(),
        ),
        (
            "app.kubernetes.io/part-of".to_string(),
            LEASE_NAME.to_string(),
        ),
    ]);
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            // A resource version of "0" only creates the Lease when it's
            // missing, leaving an existing holder untouched.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
    }
}

async fn ensure_lease(api: &k8s::Api<Lease>, lease: Lease) -> Result<()> {
    let params = PatchParams::apply(LEASE_NAME);
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(lease) => {
            info!(version = ?lease.metadata.resource_version, "Created Lease");
            Ok(())
        }
        Err(k8s::Error::Api(error)) if error.code == 409 => {
            debug!("Lease already exists");
            Ok(())
        }
        Err(error) => Err(error).context("failed to create Lease"),
    }
}

//! # Finalizer & Cleanup
//!
//! The resource carries `stoker.dev/finalizer` so derived artifacts
//! (metadata record, status record, token secret, agent RBAC) are deleted
//! before the resource itself goes away.

use crate::reconciler::rbac::remove_agent_rbac;
use crate::reconciler::types::Reconciler;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use stoker_api::records::{metadata_record_name, status_record_name, token_secret_name};
use stoker_api::{annotations, GatewaySync};
use tracing::info;

/// Add the finalizer if missing. Returns true when a patch was written.
pub async fn ensure_finalizer(client: &Client, sync: &GatewaySync) -> Result<bool> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let name = sync.metadata.name.as_deref().unwrap_or_default();

    let mut finalizers = sync.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == annotations::FINALIZER) {
        return Ok(false);
    }
    finalizers.push(annotations::FINALIZER.to_string());

    let api: Api<GatewaySync> = Api::namespaced(client.clone(), namespace);
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await
    .with_context(|| format!("adding finalizer to {namespace}/{name}"))?;
    info!(resource = name, "finalizer added");
    Ok(true)
}

/// Delete derived artifacts, then drop the finalizer so deletion proceeds
pub async fn cleanup_and_release(ctx: &Reconciler, sync: &GatewaySync) -> Result<()> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let name = sync.metadata.name.as_deref().unwrap_or_default();
    info!(resource = name, "cleaning up derived artifacts");

    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    // Not-found errors are fine: artifacts may never have been created
    let _ = config_maps
        .delete(&metadata_record_name(name), &Default::default())
        .await;
    let _ = config_maps
        .delete(&status_record_name(name), &Default::default())
        .await;
    let _ = secrets
        .delete(&token_secret_name(name), &Default::default())
        .await;
    remove_agent_rbac(&ctx.client, namespace, name).await?;
    ctx.token_broker
        .forget(&Reconciler::resource_key(namespace, name));

    let remaining: Vec<String> = sync
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != annotations::FINALIZER)
        .collect();
    let api: Api<GatewaySync> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": remaining } })),
    )
    .await
    .with_context(|| format!("removing finalizer from {namespace}/{name}"))?;
    info!(resource = name, "finalizer released");
    Ok(())
}

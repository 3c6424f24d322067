//! # Derived Artifacts
//!
//! Work-unit step 4: idempotent writes of the metadata record, the status
//! record skeleton, and the derived GitHub App token secret. All derived
//! artifacts are owner-referenced to the resource so ownership stays a
//! one-way tree; deletion cascades through the finalizer.

use crate::github::InstallationToken;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use stoker_api::records::{
    metadata_record_name, status_record_name, token_keys, token_secret_name,
};
use stoker_api::{annotations, GatewaySync, MetadataRecord};
use tracing::{debug, info};

/// Labels stamped on every derived record
fn record_labels(cr_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            annotations::MANAGED_BY.to_string(),
        ),
        (annotations::OWNED_BY_LABEL.to_string(), cr_name.to_string()),
    ])
}

fn owner_reference(sync: &GatewaySync) -> OwnerReference {
    OwnerReference {
        api_version: GatewaySync::api_version(&()).into_owned(),
        kind: GatewaySync::kind(&()).into_owned(),
        name: sync.metadata.name.clone().unwrap_or_default(),
        uid: sync.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(false),
    }
}

fn record_meta(sync: &GatewaySync, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: sync.metadata.namespace.clone(),
        labels: Some(record_labels(
            sync.metadata.name.as_deref().unwrap_or_default(),
        )),
        owner_references: Some(vec![owner_reference(sync)]),
        ..Default::default()
    }
}

/// Write the metadata record, creating it on first reconcile and merge-
/// patching afterwards. Returns true when the data actually changed.
pub async fn apply_metadata_record(
    client: &Client,
    sync: &GatewaySync,
    record: &MetadataRecord,
) -> Result<bool> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let cr_name = sync.metadata.name.as_deref().unwrap_or_default();
    let name = metadata_record_name(cr_name);
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let data = record.to_data().context("flattening metadata record")?;

    match api.get_opt(&name).await? {
        None => {
            let config_map = ConfigMap {
                metadata: record_meta(sync, &name),
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &config_map)
                .await
                .with_context(|| format!("creating metadata record {name}"))?;
            info!(record = name.as_str(), "metadata record created");
            Ok(true)
        }
        Some(existing) => {
            if existing.data.as_ref() == Some(&data) {
                debug!(record = name.as_str(), "metadata record unchanged");
                return Ok(false);
            }
            let patch = serde_json::json!({ "data": data });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .with_context(|| format!("patching metadata record {name}"))?;
            info!(record = name.as_str(), commit = record.commit.as_str(), "metadata record updated");
            Ok(true)
        }
    }
}

/// Ensure the status-aggregate record exists so agents can publish into it
pub async fn ensure_status_record(client: &Client, sync: &GatewaySync) -> Result<()> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let cr_name = sync.metadata.name.as_deref().unwrap_or_default();
    let name = status_record_name(cr_name);
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);

    if api.get_opt(&name).await?.is_none() {
        let config_map = ConfigMap {
            metadata: record_meta(sync, &name),
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        api.create(&PostParams::default(), &config_map)
            .await
            .with_context(|| format!("creating status record {name}"))?;
        info!(record = name.as_str(), "status record created");
    }
    Ok(())
}

/// Write the derived token secret for GitHub App auth. Updated in place so
/// the agent's projected volume sees the rotation.
pub async fn apply_token_secret(
    client: &Client,
    sync: &GatewaySync,
    token: &InstallationToken,
) -> Result<()> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let cr_name = sync.metadata.name.as_deref().unwrap_or_default();
    let name = token_secret_name(cr_name);
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let data = BTreeMap::from([
        (
            token_keys::TOKEN.to_string(),
            ByteString(token.token.clone().into_bytes()),
        ),
        (
            token_keys::EXPIRES_AT.to_string(),
            ByteString(token.expires_at.to_rfc3339().into_bytes()),
        ),
    ]);

    match api.get_opt(&name).await? {
        None => {
            let secret = Secret {
                metadata: record_meta(sync, &name),
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &secret)
                .await
                .with_context(|| format!("creating token secret {name}"))?;
            info!(secret = name.as_str(), "derived token secret created");
        }
        Some(existing) => {
            if existing.data.as_ref() == Some(&data) {
                debug!(secret = name.as_str(), "derived token secret unchanged");
                return Ok(());
            }
            let patch = serde_json::json!({
                "data": {
                    token_keys::TOKEN: base64_encode(token.token.as_bytes()),
                    token_keys::EXPIRES_AT: base64_encode(token.expires_at.to_rfc3339().as_bytes()),
                }
            });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .with_context(|| format!("patching token secret {name}"))?;
            info!(secret = name.as_str(), "derived token secret rotated");
        }
    }
    Ok(())
}

fn base64_encode(input: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(input)
}

//! # Status Publishing
//!
//! Writes this gateway's entry into the status-aggregate ConfigMap. The
//! record is one key per gateway, so agents only contend on the ConfigMap
//! resource version; writes retry on conflict up to three times.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use stoker_api::records::status_record_name;
use stoker_api::GatewayStatusRecord;
use tracing::{debug, warn};

const MAX_CONFLICT_RETRIES: usize = 3;

/// Publish this gateway's status record
pub async fn publish_status(
    client: &Client,
    namespace: &str,
    cr_name: &str,
    record: &GatewayStatusRecord,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let name = status_record_name(cr_name);
    let payload =
        serde_json::to_string(record).context("serializing gateway status record")?;

    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let mut config_map = api
            .get(&name)
            .await
            .with_context(|| format!("fetching status record {namespace}/{name}"))?;
        config_map
            .data
            .get_or_insert_with(Default::default)
            .insert(record.gateway.clone(), payload.clone());
        // Replace rather than patch so a concurrent reconciler prune is not
        // silently resurrected; conflicts retry with fresh state
        match api.replace(&name, &PostParams::default(), &config_map).await {
            Ok(_) => {
                debug!(
                    gateway = record.gateway.as_str(),
                    status = record.sync_status.as_str(),
                    "status record published"
                );
                return Ok(());
            }
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < MAX_CONFLICT_RETRIES => {
                warn!(attempt, "status record conflict, retrying");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("updating status record {name}"));
            }
        }
    }
    anyhow::bail!("status record update for {name} kept conflicting");
}

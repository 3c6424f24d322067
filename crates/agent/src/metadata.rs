//! # Metadata Record Access
//!
//! Reads the controller-published metadata ConfigMap and polls it for
//! changes, pushing a trigger into the coalescing channel when the content
//! moves.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::time::Duration;
use stoker_api::records::metadata_record_name;
use stoker_api::MetadataRecord;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::run::Trigger;

/// Fetch and parse the metadata record for a resource
pub async fn fetch_metadata(
    client: &Client,
    namespace: &str,
    cr_name: &str,
) -> Result<MetadataRecord> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let name = metadata_record_name(cr_name);
    let config_map = api
        .get(&name)
        .await
        .with_context(|| format!("fetching metadata record {namespace}/{name}"))?;
    let data = config_map.data.unwrap_or_default();
    MetadataRecord::from_data(&data).with_context(|| format!("parsing metadata record {name}"))
}

/// Poll the metadata record and emit a trigger when it changes.
///
/// A bounded channel of capacity 1 coalesces triggers, so a burst of
/// changes collapses into a single extra sync.
pub async fn poll_metadata(
    client: Client,
    namespace: String,
    cr_name: String,
    interval: Duration,
    tx: mpsc::Sender<Trigger>,
) {
    let mut last: Option<MetadataRecord> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match fetch_metadata(&client, &namespace, &cr_name).await {
            Ok(record) => {
                let changed = last.as_ref() != Some(&record);
                if changed && last.is_some() {
                    debug!(commit = record.commit.as_str(), "metadata record changed");
                    let _ = tx.try_send(Trigger::MetadataChanged);
                }
                last = Some(record);
            }
            Err(e) => {
                warn!(error = %e, "metadata poll failed");
            }
        }
    }
}

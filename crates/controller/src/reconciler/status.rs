//! # Status Aggregation & Conditions
//!
//! Work-unit steps 7 and 8: merge agent-written status records with
//! discovered pods, prune entries for gateways gone past the grace window,
//! and compute the resource-level conditions.

use crate::reconciler::discovery::DiscoveredPod;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use stoker_api::crd::condition_types;
use stoker_api::records::status_record_name;
use stoker_api::{
    Condition, DiscoveredGateway, GatewaySync, GatewaySyncStatus, GatewayStatusRecord, SyncPhase,
};
use tracing::{debug, info, warn};

/// Entries for undiscovered gateways are dropped after this long
pub const STALE_GATEWAY_GRACE: ChronoDuration = ChronoDuration::minutes(10);

/// Read and parse all agent status records for a resource
pub async fn read_status_records(
    client: &Client,
    namespace: &str,
    cr_name: &str,
) -> Result<BTreeMap<String, GatewayStatusRecord>> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let name = status_record_name(cr_name);
    let Some(config_map) = api.get_opt(&name).await? else {
        return Ok(BTreeMap::new());
    };
    let mut records = BTreeMap::new();
    for (gateway, payload) in config_map.data.unwrap_or_default() {
        match serde_json::from_str::<GatewayStatusRecord>(&payload) {
            Ok(record) => {
                records.insert(gateway, record);
            }
            Err(e) => {
                warn!(gateway = gateway.as_str(), error = %e, "unparsable status record entry");
            }
        }
    }
    Ok(records)
}

/// Remove record entries for gateways that disappeared more than the grace
/// window ago
pub async fn prune_stale_records(
    client: &Client,
    namespace: &str,
    cr_name: &str,
    discovered: &[DiscoveredPod],
    records: &BTreeMap<String, GatewayStatusRecord>,
) -> Result<()> {
    let stale: Vec<&String> = records
        .iter()
        .filter(|(gateway, record)| {
            let still_discovered = discovered
                .iter()
                .any(|pod| pod.gateway_name == **gateway);
            !still_discovered && is_stale(record, Utc::now())
        })
        .map(|(gateway, _)| gateway)
        .collect();
    if stale.is_empty() {
        return Ok(());
    }

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let name = status_record_name(cr_name);
    // Merge patch with nulls deletes the keys
    let removals: BTreeMap<&str, Option<String>> = stale
        .iter()
        .map(|gateway| (gateway.as_str(), None))
        .collect();
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "data": removals })),
    )
    .await
    .with_context(|| format!("pruning status record {name}"))?;
    info!(pruned = stale.len(), record = name.as_str(), "stale gateway entries dropped");
    Ok(())
}

/// Whether an undiscovered gateway's record is old enough to drop
#[must_use]
pub fn is_stale(record: &GatewayStatusRecord, now: DateTime<Utc>) -> bool {
    match record
        .last_sync_time
        .as_deref()
        .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
    {
        Some(last) => now.signed_duration_since(last.with_timezone(&Utc)) > STALE_GATEWAY_GRACE,
        // Never reported and gone: drop immediately
        None => true,
    }
}

/// Merge discovered pods with agent records into status entries
#[must_use]
pub fn aggregate_gateways(
    discovered: &[DiscoveredPod],
    records: &BTreeMap<String, GatewayStatusRecord>,
) -> Vec<DiscoveredGateway> {
    discovered
        .iter()
        .map(|pod| {
            let record = records.get(&pod.gateway_name);
            let sync_status = if !pod.has_agent {
                SyncPhase::MissingSidecar
            } else {
                match record.map(|r| r.sync_status.as_str()) {
                    Some("Synced") => SyncPhase::Synced,
                    Some("Error") => SyncPhase::Error,
                    _ => SyncPhase::Pending,
                }
            };
            DiscoveredGateway {
                name: pod.gateway_name.clone(),
                namespace: pod.namespace.clone(),
                pod_name: pod.pod_name.clone(),
                service_account_name: pod.service_account.clone(),
                profile: pod
                    .profile
                    .clone()
                    .or_else(|| record.map(|r| r.profile.clone())),
                sync_status,
                synced_commit: record.and_then(|r| r.synced_commit.clone()),
                synced_ref: record.and_then(|r| r.synced_ref.clone()),
                last_sync_time: record.and_then(|r| r.last_sync_time.clone()),
                last_sync_duration: record.and_then(|r| r.last_sync_duration.clone()),
                agent_version: record.and_then(|r| r.agent_version.clone()),
                last_scan_result: record.and_then(|r| r.last_scan_result.clone()),
                files_changed: record.and_then(|r| r.files_changed),
                projects_synced: record.map(|r| r.projects_synced.clone()).unwrap_or_default(),
                message: record.and_then(|r| r.message.clone()),
            }
        })
        .collect()
}

/// Inputs to condition computation
#[derive(Debug, Default)]
pub struct ConditionInputs<'a> {
    pub ref_resolved: Option<(bool, &'a str, Option<String>)>,
    pub profiles_valid: Option<(bool, &'a str, Option<String>)>,
    pub gateways: &'a [DiscoveredGateway],
    pub current_commit: Option<&'a str>,
    /// Gateways carrying a ref-override annotation
    pub overridden_gateways: &'a [String],
    pub ssh_without_known_hosts: bool,
    pub github_exchange_error: Option<String>,
}

/// Compute the condition set, preserving transition times for unchanged
/// statuses
#[must_use]
pub fn compute_conditions(inputs: &ConditionInputs<'_>, previous: &[Condition]) -> Vec<Condition> {
    let mut conditions = Vec::new();

    let (ref_resolved, ref_reason, ref_message) = match &inputs.ref_resolved {
        Some((status, reason, message)) => (*status, *reason, message.clone()),
        None => (false, "NotResolved", None),
    };
    conditions.push(Condition::now(
        condition_types::REF_RESOLVED,
        ref_resolved,
        ref_reason,
        ref_message,
    ));

    let (profiles_valid, profile_reason, profile_message) = match &inputs.profiles_valid {
        Some((status, reason, message)) => (*status, *reason, message.clone()),
        None => (false, "NotValidated", None),
    };
    conditions.push(Condition::now(
        condition_types::PROFILES_VALID,
        profiles_valid,
        profile_reason,
        profile_message,
    ));

    let all_synced = inputs.gateways.iter().all(|gateway| {
        gateway.sync_status == SyncPhase::Synced
            && match (inputs.current_commit, gateway.synced_commit.as_deref()) {
                (Some(current), Some(synced)) => {
                    // Overridden gateways intentionally track another commit
                    current == synced || inputs.overridden_gateways.contains(&gateway.name)
                }
                _ => false,
            }
    });
    let (synced_reason, synced_message) = if inputs.gateways.is_empty() {
        ("NoGateways", Some("no gateways discovered".to_string()))
    } else if all_synced {
        ("AllSynced", None)
    } else {
        let lagging: Vec<&str> = inputs
            .gateways
            .iter()
            .filter(|gateway| gateway.sync_status != SyncPhase::Synced)
            .map(|gateway| gateway.name.as_str())
            .collect();
        ("GatewaysPending", Some(format!("not synced: {}", lagging.join(", "))))
    };
    let all_synced = all_synced || inputs.gateways.is_empty();
    conditions.push(Condition::now(
        condition_types::ALL_GATEWAYS_SYNCED,
        all_synced,
        synced_reason,
        synced_message,
    ));

    let missing: Vec<&str> = inputs
        .gateways
        .iter()
        .filter(|gateway| gateway.sync_status == SyncPhase::MissingSidecar)
        .map(|gateway| gateway.name.as_str())
        .collect();
    conditions.push(Condition::now(
        condition_types::SIDECAR_INJECTED,
        missing.is_empty(),
        if missing.is_empty() {
            "AllInjected"
        } else {
            "MissingSidecar"
        },
        if missing.is_empty() {
            None
        } else {
            Some(format!("missing agent: {}", missing.join(", ")))
        },
    ));

    // Advisory: a gateway deliberately tracks a different commit
    let skewed: Vec<&str> = inputs
        .gateways
        .iter()
        .filter(|gateway| {
            inputs.overridden_gateways.contains(&gateway.name)
                && gateway.synced_commit.as_deref() != inputs.current_commit
                && gateway.synced_commit.is_some()
        })
        .map(|gateway| gateway.name.as_str())
        .collect();
    if !skewed.is_empty() {
        conditions.push(Condition::now(
            condition_types::REF_SKEW,
            true,
            "RefOverride",
            Some(format!("gateways on overridden refs: {}", skewed.join(", "))),
        ));
    }

    if inputs.ssh_without_known_hosts {
        conditions.push(Condition::now(
            condition_types::SSH_HOST_KEY_VERIFICATION,
            false,
            "NoKnownHosts",
            Some("SSH auth configured without known_hosts; host keys are not verified".to_string()),
        ));
    }

    if let Some(message) = &inputs.github_exchange_error {
        let reason = message
            .split(':')
            .next()
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or("ExchangeFailed");
        conditions.push(Condition::now(
            condition_types::GITHUB_APP_EXCHANGE_FAILED,
            true,
            reason,
            Some(message.clone()),
        ));
    }

    let ready = ref_resolved && profiles_valid && all_synced;
    conditions.push(Condition::now(
        condition_types::READY,
        ready,
        if ready { "AllChecksPassed" } else { "NotReady" },
        None,
    ));

    preserve_transition_times(conditions, previous)
}

/// Keep the previous transition time when a condition's status did not flip
fn preserve_transition_times(
    mut conditions: Vec<Condition>,
    previous: &[Condition],
) -> Vec<Condition> {
    for condition in &mut conditions {
        if let Some(old) = previous
            .iter()
            .find(|old| old.r#type == condition.r#type && old.status == condition.status)
        {
            condition.last_transition_time = old.last_transition_time.clone();
        }
    }
    conditions
}

/// Find a condition by type
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.r#type == r#type)
}

/// Patch the status subresource with a merge patch built from the computed
/// status; version conflicts bubble up so the whole work unit retries
pub async fn patch_status(
    client: &Client,
    sync: &GatewaySync,
    status: &GatewaySyncStatus,
) -> Result<()> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let name = sync.metadata.name.as_deref().unwrap_or_default();
    let api: Api<GatewaySync> = Api::namespaced(client.clone(), namespace);
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await
    .with_context(|| format!("patching status of {namespace}/{name}"))?;
    debug!(resource = name, "status patched");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(name: &str, status: SyncPhase, commit: Option<&str>) -> DiscoveredGateway {
        DiscoveredGateway {
            name: name.to_string(),
            namespace: "ignition".to_string(),
            pod_name: format!("{name}-0"),
            service_account_name: Some("gateway".to_string()),
            profile: Some("default".to_string()),
            sync_status: status,
            synced_commit: commit.map(str::to_string),
            synced_ref: None,
            last_sync_time: None,
            last_sync_duration: None,
            agent_version: None,
            last_scan_result: None,
            files_changed: None,
            projects_synced: Vec::new(),
            message: None,
        }
    }

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    fn inputs<'a>(gateways: &'a [DiscoveredGateway]) -> ConditionInputs<'a> {
        ConditionInputs {
            ref_resolved: Some((true, "Resolved", None)),
            profiles_valid: Some((true, "Validated", None)),
            gateways,
            current_commit: Some(COMMIT),
            overridden_gateways: &[],
            ssh_without_known_hosts: false,
            github_exchange_error: None,
        }
    }

    #[test]
    fn ready_requires_all_three_conjuncts() {
        let gateways = vec![gateway("edge", SyncPhase::Synced, Some(COMMIT))];
        let conditions = compute_conditions(&inputs(&gateways), &[]);
        let ready = find_condition(&conditions, condition_types::READY).expect("ready");
        assert_eq!(ready.status, "True");

        let mut bad = inputs(&gateways);
        bad.ref_resolved = Some((false, "RefNotFound", None));
        let conditions = compute_conditions(&bad, &[]);
        let ready = find_condition(&conditions, condition_types::READY).expect("ready");
        assert_eq!(ready.status, "False");
    }

    #[test]
    fn pending_gateway_blocks_all_synced() {
        let gateways = vec![
            gateway("edge-a", SyncPhase::Synced, Some(COMMIT)),
            gateway("edge-b", SyncPhase::Pending, None),
        ];
        let conditions = compute_conditions(&inputs(&gateways), &[]);
        let synced =
            find_condition(&conditions, condition_types::ALL_GATEWAYS_SYNCED).expect("cond");
        assert_eq!(synced.status, "False");
        assert!(synced.message.as_deref().unwrap_or_default().contains("edge-b"));
    }

    #[test]
    fn stale_commit_blocks_all_synced() {
        let gateways = vec![gateway(
            "edge",
            SyncPhase::Synced,
            Some("ffffffffffffffffffffffffffffffffffffffff"),
        )];
        let conditions = compute_conditions(&inputs(&gateways), &[]);
        let synced =
            find_condition(&conditions, condition_types::ALL_GATEWAYS_SYNCED).expect("cond");
        assert_eq!(synced.status, "False");
    }

    #[test]
    fn missing_sidecar_surfaces_in_both_conditions() {
        let gateways = vec![gateway("edge", SyncPhase::MissingSidecar, None)];
        let conditions = compute_conditions(&inputs(&gateways), &[]);
        let injected =
            find_condition(&conditions, condition_types::SIDECAR_INJECTED).expect("cond");
        assert_eq!(injected.status, "False");
        assert_eq!(injected.reason.as_deref(), Some("MissingSidecar"));
    }

    #[test]
    fn ref_override_produces_skew_not_failure() {
        let gateways = vec![gateway(
            "edge",
            SyncPhase::Synced,
            Some("ffffffffffffffffffffffffffffffffffffffff"),
        )];
        let overridden = vec!["edge".to_string()];
        let mut with_override = inputs(&gateways);
        with_override.overridden_gateways = &overridden;
        let conditions = compute_conditions(&with_override, &[]);

        let skew = find_condition(&conditions, condition_types::REF_SKEW).expect("skew");
        assert_eq!(skew.status, "True");
        // The override is deliberate, so it does not block AllGatewaysSynced
        let synced =
            find_condition(&conditions, condition_types::ALL_GATEWAYS_SYNCED).expect("cond");
        assert_eq!(synced.status, "True");
    }

    #[test]
    fn transition_times_survive_unchanged_statuses() {
        let gateways = vec![gateway("edge", SyncPhase::Synced, Some(COMMIT))];
        let first = compute_conditions(&inputs(&gateways), &[]);
        let stamped: Vec<Condition> = first
            .iter()
            .cloned()
            .map(|mut condition| {
                condition.last_transition_time = Some("2026-01-01T00:00:00Z".to_string());
                condition
            })
            .collect();
        let second = compute_conditions(&inputs(&gateways), &stamped);
        let ready = find_condition(&second, condition_types::READY).expect("ready");
        assert_eq!(
            ready.last_transition_time.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn stale_detection_uses_the_grace_window() {
        let now = Utc::now();
        let fresh = GatewayStatusRecord {
            last_sync_time: Some((now - ChronoDuration::minutes(5)).to_rfc3339()),
            ..Default::default()
        };
        assert!(!is_stale(&fresh, now));
        let old = GatewayStatusRecord {
            last_sync_time: Some((now - ChronoDuration::minutes(11)).to_rfc3339()),
            ..Default::default()
        };
        assert!(is_stale(&old, now));
        let never = GatewayStatusRecord::default();
        assert!(is_stale(&never, now));
    }

    #[test]
    fn aggregation_merges_records_with_discovery() {
        let discovered = vec![crate::reconciler::discovery::DiscoveredPod {
            gateway_name: "edge".to_string(),
            pod_name: "edge-0".to_string(),
            namespace: "ignition".to_string(),
            service_account: Some("gateway".to_string()),
            profile: None,
            has_agent: true,
            ref_override: None,
        }];
        let records = BTreeMap::from([(
            "edge".to_string(),
            GatewayStatusRecord {
                gateway: "edge".to_string(),
                pod_name: "edge-0".to_string(),
                profile: "default".to_string(),
                sync_status: "Synced".to_string(),
                synced_commit: Some(COMMIT.to_string()),
                projects_synced: vec!["alpha".to_string()],
                ..Default::default()
            },
        )]);
        let gateways = aggregate_gateways(&discovered, &records);
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].sync_status, SyncPhase::Synced);
        assert_eq!(gateways[0].projects_synced, vec!["alpha"]);
        assert_eq!(gateways[0].profile.as_deref(), Some("default"));
    }

    #[test]
    fn missing_agent_wins_over_any_record() {
        let discovered = vec![crate::reconciler::discovery::DiscoveredPod {
            gateway_name: "edge".to_string(),
            pod_name: "edge-0".to_string(),
            namespace: "ignition".to_string(),
            service_account: None,
            profile: None,
            has_agent: false,
            ref_override: None,
        }];
        let records = BTreeMap::from([(
            "edge".to_string(),
            GatewayStatusRecord {
                sync_status: "Synced".to_string(),
                ..Default::default()
            },
        )]);
        let gateways = aggregate_gateways(&discovered, &records);
        assert_eq!(gateways[0].sync_status, SyncPhase::MissingSidecar);
    }
}

//! # GatewaySync Status
//!
//! Observed-state types: ref resolution, discovered gateways, conditions.

use serde::{Deserialize, Serialize};

/// Status of the GatewaySync resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySyncStatus {
    /// Generation most recently acted on
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Ref resolution phase
    #[serde(default)]
    pub ref_resolution: Option<RefResolutionPhase>,
    /// Full 40-character commit SHA of the last resolution
    #[serde(default)]
    pub last_sync_commit: Option<String>,
    /// 7-character short form of lastSyncCommit
    #[serde(default)]
    pub last_sync_commit_short: Option<String>,
    /// Ref the commit was resolved from (spec ref or requested-ref override)
    #[serde(default)]
    pub last_sync_ref: Option<String>,
    /// Updated only when the resolved commit changes, so it reads as a
    /// "last change" timestamp rather than a "last poll" timestamp
    #[serde(default)]
    pub last_sync_time: Option<String>,
    /// Number of profiles in the spec
    #[serde(default)]
    pub profile_count: Option<i32>,
    /// Number of discovered gateways
    #[serde(default)]
    pub gateway_count: Option<i32>,
    /// Discovered gateway pods and their per-gateway sync state
    #[serde(default)]
    pub discovered_gateways: Vec<DiscoveredGateway>,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Ref resolution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum RefResolutionPhase {
    /// No resolution attempted yet
    NotResolved,
    /// Resolution in flight
    Resolving,
    /// Ref resolved to a commit
    Resolved,
    /// Resolution failed; see the RefResolved condition for the reason
    Error,
}

/// Per-gateway sync state, merged from the status-aggregate record
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredGateway {
    /// Gateway name (annotation, app.kubernetes.io/name label, or pod name)
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod backing this gateway
    pub pod_name: String,
    /// Service account the pod runs as (granted record access via RBAC)
    #[serde(default)]
    pub service_account_name: Option<String>,
    /// Profile selected for this gateway
    #[serde(default)]
    pub profile: Option<String>,
    /// Sync phase reported by the agent (or MissingSidecar when the pod has
    /// no agent container)
    pub sync_status: SyncPhase,
    /// Commit the agent last synced
    #[serde(default)]
    pub synced_commit: Option<String>,
    /// Ref the agent last synced (differs from the resource under ref-override)
    #[serde(default)]
    pub synced_ref: Option<String>,
    /// When the agent last completed a sync
    #[serde(default)]
    pub last_sync_time: Option<String>,
    /// Duration of the last sync, e.g. "1.52s"
    #[serde(default)]
    pub last_sync_duration: Option<String>,
    /// Agent build version
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Outcome of the post-sync gateway scan
    #[serde(default)]
    pub last_scan_result: Option<String>,
    /// Files added + modified + deleted by the last sync
    #[serde(default)]
    pub files_changed: Option<i32>,
    /// Top-level project directories synced
    #[serde(default)]
    pub projects_synced: Vec<String>,
    /// Error message when syncStatus is Error
    #[serde(default)]
    pub message: Option<String>,
}

/// Per-gateway sync phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum SyncPhase {
    /// Discovered but no agent report yet
    Pending,
    /// Agent reports the current commit synced and the scan succeeded
    Synced,
    /// Agent reported a failure; see message
    Error,
    /// Pod opted in but carries no agent container
    MissingSidecar,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Build a condition stamped with the current time
    #[must_use]
    pub fn now(r#type: &str, status: bool, reason: &str, message: Option<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message,
        }
    }
}

/// Condition types computed by the reconciler
pub mod condition_types {
    /// The declared ref resolved to a commit
    pub const REF_RESOLVED: &str = "RefResolved";
    /// Every profile validated (templates compile, paths safe, vars legal)
    pub const PROFILES_VALID: &str = "ProfilesValid";
    /// Every discovered gateway reports Synced for the current commit
    pub const ALL_GATEWAYS_SYNCED: &str = "AllGatewaysSynced";
    /// Every discovered gateway pod carries the agent container
    pub const SIDECAR_INJECTED: &str = "SidecarInjected";
    /// RefResolved and ProfilesValid and AllGatewaysSynced
    pub const READY: &str = "Ready";
    /// Advisory: SSH auth configured without known_hosts
    pub const SSH_HOST_KEY_VERIFICATION: &str = "SSHHostKeyVerification";
    /// Advisory: a gateway syncs a different commit due to ref-override
    pub const REF_SKEW: &str = "RefSkew";
    /// Advisory: GitHub App token exchange failed
    pub const GITHUB_APP_EXCHANGE_FAILED: &str = "GitHubAppExchangeFailed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_now_stamps_transition_time() {
        let cond = Condition::now("Ready", true, "AllChecksPassed", None);
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason.as_deref(), Some("AllChecksPassed"));
        assert!(cond.last_transition_time.is_some());
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = GatewaySyncStatus {
            last_sync_commit_short: Some("abc1234".to_string()),
            ref_resolution: Some(RefResolutionPhase::Resolved),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).expect("serializes");
        assert_eq!(json["lastSyncCommitShort"], "abc1234");
        assert_eq!(json["refResolution"], "Resolved");
    }
}

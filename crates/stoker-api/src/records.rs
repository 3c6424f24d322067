//! # Derived Records
//!
//! Names and payloads of the artifacts the reconciler owns per resource:
//!
//! - metadata ConfigMap (`stoker-metadata-<cr>`): written by the controller,
//!   read by agents; describes the target commit and the resolved profiles
//! - status ConfigMap (`stoker-status-<cr>`): one key per gateway, written
//!   by agents, read by the controller
//! - token Secret (`stoker-github-token-<cr>`): short-lived GitHub App
//!   installation token, only present for GitHub App auth

use crate::profile::ResolvedProfileSet;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Derived record name prefix
pub const RECORD_PREFIX: &str = "stoker";

/// Name of the metadata ConfigMap for a resource
#[must_use]
pub fn metadata_record_name(cr_name: &str) -> String {
    format!("{RECORD_PREFIX}-metadata-{cr_name}")
}

/// Name of the status-aggregate ConfigMap for a resource
#[must_use]
pub fn status_record_name(cr_name: &str) -> String {
    format!("{RECORD_PREFIX}-status-{cr_name}")
}

/// Name of the derived GitHub App token Secret for a resource
#[must_use]
pub fn token_secret_name(cr_name: &str) -> String {
    format!("{RECORD_PREFIX}-github-token-{cr_name}")
}

/// Name of the per-namespace Role/RoleBinding authorizing gateway service
/// accounts to read the records of a resource
#[must_use]
pub fn agent_rbac_name(cr_name: &str) -> String {
    format!("{RECORD_PREFIX}-agent-{cr_name}")
}

/// Data keys in the metadata ConfigMap
pub mod metadata_keys {
    pub const GIT_URL: &str = "gitUrl";
    pub const COMMIT: &str = "commit";
    pub const REF: &str = "ref";
    pub const TRIGGER: &str = "trigger";
    pub const PAUSED: &str = "paused";
    pub const EXCLUDE_PATTERNS: &str = "excludePatterns";
    pub const PROFILES: &str = "profiles";
}

/// Data keys in the derived token Secret
pub mod token_keys {
    pub const TOKEN: &str = "token";
    pub const EXPIRES_AT: &str = "expiresAt";
}

/// Published desired state, one per resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    /// Repository URL agents clone from
    pub git_url: String,
    /// Target commit (full SHA)
    pub commit: String,
    /// Ref the commit was resolved from
    pub r#ref: String,
    /// What caused the current record (spec, webhook source, or poll)
    pub trigger: String,
    /// Global pause flag from the spec
    pub paused: bool,
    /// Resource-level exclude patterns (defaults only; profiles carry their
    /// own merged set inside the blob)
    pub exclude_patterns: Vec<String>,
    /// All profiles resolved against sync.defaults
    pub profiles: ResolvedProfileSet,
}

impl MetadataRecord {
    /// Flatten into ConfigMap data
    pub fn to_data(&self) -> Result<BTreeMap<String, String>> {
        let mut data = BTreeMap::new();
        data.insert(metadata_keys::GIT_URL.to_string(), self.git_url.clone());
        data.insert(metadata_keys::COMMIT.to_string(), self.commit.clone());
        data.insert(metadata_keys::REF.to_string(), self.r#ref.clone());
        data.insert(metadata_keys::TRIGGER.to_string(), self.trigger.clone());
        data.insert(metadata_keys::PAUSED.to_string(), self.paused.to_string());
        data.insert(
            metadata_keys::EXCLUDE_PATTERNS.to_string(),
            serde_json::to_string(&self.exclude_patterns)
                .context("serializing exclude patterns")?,
        );
        data.insert(
            metadata_keys::PROFILES.to_string(),
            serde_json::to_string(&self.profiles).context("serializing resolved profiles")?,
        );
        Ok(data)
    }

    /// Parse back from ConfigMap data
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| -> Result<&String> {
            data.get(key)
                .with_context(|| format!("metadata record missing key '{key}'"))
        };
        Ok(Self {
            git_url: get(metadata_keys::GIT_URL)?.clone(),
            commit: get(metadata_keys::COMMIT)?.clone(),
            r#ref: get(metadata_keys::REF)?.clone(),
            trigger: get(metadata_keys::TRIGGER)?.clone(),
            paused: get(metadata_keys::PAUSED)?.parse().unwrap_or(false),
            exclude_patterns: serde_json::from_str(get(metadata_keys::EXCLUDE_PATTERNS)?)
                .context("parsing exclude patterns")?,
            profiles: serde_json::from_str(get(metadata_keys::PROFILES)?)
                .context("parsing resolved profiles")?,
        })
    }
}

/// One gateway's sync report, stored as JSON under its gateway-name key in
/// the status-aggregate ConfigMap
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatusRecord {
    /// Gateway name (also the ConfigMap data key)
    pub gateway: String,
    /// Pod the agent runs in
    pub pod_name: String,
    /// Profile the agent synced
    pub profile: String,
    /// "Synced", "Error", or "Pending"
    pub sync_status: String,
    /// Commit last applied to the live tree
    #[serde(default)]
    pub synced_commit: Option<String>,
    /// Ref the agent checked out (reflects ref-override when set)
    #[serde(default)]
    pub synced_ref: Option<String>,
    /// RFC 3339 time of the last completed sync
    #[serde(default)]
    pub last_sync_time: Option<String>,
    /// Human-readable duration of the last sync
    #[serde(default)]
    pub last_sync_duration: Option<String>,
    /// Agent build version
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Result of the post-sync gateway scan ("ok" or an error summary)
    #[serde(default)]
    pub last_scan_result: Option<String>,
    /// Total files added + modified + deleted
    #[serde(default)]
    pub files_changed: Option<i32>,
    /// Top-level project directories synced under a "projects" destination
    #[serde(default)]
    pub projects_synced: Vec<String>,
    /// Error detail when syncStatus is "Error"
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_carry_the_prefix() {
        assert_eq!(metadata_record_name("plant"), "stoker-metadata-plant");
        assert_eq!(status_record_name("plant"), "stoker-status-plant");
        assert_eq!(token_secret_name("plant"), "stoker-github-token-plant");
        assert_eq!(agent_rbac_name("plant"), "stoker-agent-plant");
    }

    #[test]
    fn metadata_record_survives_the_configmap_shape() {
        let record = MetadataRecord {
            git_url: "https://example.com/config.git".to_string(),
            commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
            r#ref: "main".to_string(),
            trigger: "spec".to_string(),
            paused: false,
            exclude_patterns: vec!["**/*.bak".to_string()],
            profiles: ResolvedProfileSet::new(),
        };
        let data = record.to_data().expect("flattens");
        assert_eq!(data.get("commit").map(String::as_str), Some(record.commit.as_str()));
        let parsed = MetadataRecord::from_data(&data).expect("parses back");
        assert_eq!(parsed, record);
    }

    #[test]
    fn from_data_reports_the_missing_key() {
        let err = MetadataRecord::from_data(&BTreeMap::new()).expect_err("must fail");
        assert!(err.to_string().contains("gitUrl"));
    }
}

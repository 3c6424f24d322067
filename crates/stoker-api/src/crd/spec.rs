//! # GatewaySync Spec
//!
//! Main CRD specification types and default values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lower bound for `syncPeriod` (seconds).
pub const MIN_SYNC_PERIOD_SECS: u64 = 5;
/// Upper bound for `syncPeriod` (seconds).
pub const MAX_SYNC_PERIOD_SECS: u64 = 3600;

/// GatewaySync Custom Resource Definition
///
/// A `GatewaySync` describes one Git source, the gateway connection, and a
/// set of named sync profiles. The controller resolves the declared ref to a
/// commit, publishes a metadata record for the agents, and aggregates
/// per-gateway sync status back onto this resource.
///
/// # Example
///
/// ```yaml
/// apiVersion: stoker.dev/v1beta1
/// kind: GatewaySync
/// metadata:
///   name: plant-gateways
///   namespace: ignition
/// spec:
///   git:
///     repo: https://github.com/example/ignition-config.git
///     ref: main
///     auth:
///       type: token
///       secretRef:
///         name: git-credentials
///   gateway:
///     port: 8088
///     api:
///       secretName: gateway-api-key
///   sync:
///     profiles:
///       default:
///         mappings:
///           - source: projects
///             destination: projects
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "GatewaySync",
    group = "stoker.dev",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::GatewaySyncStatus",
    shortname = "gws",
    printcolumn = r#"{"name":"Ref", "type":"string", "jsonPath":".status.lastSyncRef"}, {"name":"Commit", "type":"string", "jsonPath":".status.lastSyncCommitShort"}, {"name":"Profiles", "type":"integer", "jsonPath":".status.profileCount"}, {"name":"Synced", "type":"string", "jsonPath":".status.conditions[?(@.type==\"AllGatewaysSynced\")].status"}, {"name":"Gateways", "type":"integer", "jsonPath":".status.gatewayCount"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Last Sync", "type":"date", "jsonPath":".status.lastSyncTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySyncSpec {
    /// Git source: repository URL, ref to track, and authentication
    pub git: GitSpec,
    /// Gateway connection parameters used by the injected agent
    pub gateway: GatewayConnection,
    /// Periodic ref polling configuration
    #[serde(default)]
    pub polling: PollingSpec,
    /// Sync defaults and named profiles
    pub sync: SyncSpec,
    /// Agent container overrides (image, resources)
    #[serde(default)]
    pub agent: Option<AgentOverrides>,
    /// Global halt: when true, no resolution, no token refresh, no agent sync
    #[serde(default)]
    pub paused: bool,
}

/// Git source configuration
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    /// Repository URL (https or ssh)
    pub repo: String,
    /// Ref to track: branch, tag, or full commit SHA
    /// Default: "main"
    #[serde(default = "default_git_ref")]
    pub r#ref: String,
    /// Authentication. Omit entirely for public repositories.
    #[serde(default)]
    pub auth: Option<GitAuthSpec>,
}

/// Git authentication
///
/// Exactly one scheme is configured. For GitHub App auth the PEM stays in
/// the controller namespace; agents only ever mount the short-lived derived
/// token secret.
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum GitAuthSpec {
    /// Static token (PAT or deploy token) referenced from a secret
    #[serde(rename_all = "camelCase")]
    Token {
        /// Secret holding the token (default key: "token")
        secret_ref: SecretKeyRef,
    },
    /// SSH private key, with optional known_hosts pinning
    #[serde(rename_all = "camelCase")]
    Ssh {
        /// Secret holding the private key (default key: "ssh-privatekey")
        key_ref: SecretKeyRef,
        /// Secret holding a known_hosts file (default key: "known_hosts").
        /// When absent, host key verification is skipped and an advisory
        /// condition is raised on the resource.
        #[serde(default)]
        known_hosts_ref: Option<SecretKeyRef>,
    },
    /// GitHub App installation
    #[serde(rename_all = "camelCase")]
    GithubApp {
        /// App ID asserted in the exchange JWT
        app_id: i64,
        /// Installation whose token is minted
        installation_id: i64,
        /// Secret holding the App private key PEM (default key: "privateKey.pem")
        pem_ref: SecretKeyRef,
        /// API base URL override for GitHub Enterprise (default: https://api.github.com)
        #[serde(default)]
        api_base_url: Option<String>,
    },
}

/// Reference to a single key inside a secret in the resource namespace
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the secret; each auth scheme has its own default
    #[serde(default)]
    pub key: Option<String>,
}

impl SecretKeyRef {
    /// Key within the secret, or the scheme default
    #[must_use]
    pub fn key_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.key.as_deref().unwrap_or(default)
    }
}

/// Gateway connection parameters
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConnection {
    /// Gateway HTTP port
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Whether the gateway serves TLS
    #[serde(default)]
    pub tls: bool,
    /// API key used for the gateway scan/session endpoints
    pub api: ApiKeyRef,
}

/// Gateway API key reference
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRef {
    /// Secret holding the API key
    pub secret_name: String,
    /// Key within the secret
    /// Default: "apiKey"
    #[serde(default = "default_api_secret_key")]
    pub secret_key: String,
}

/// Periodic ref polling
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollingSpec {
    /// Whether the controller re-resolves the ref on a timer
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll interval as a Kubernetes duration string (e.g. "30s", "5m", "1h")
    /// Default: "5m"
    #[serde(default = "default_polling_interval")]
    pub interval: String,
}

impl Default for PollingSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_polling_interval(),
        }
    }
}

/// Sync configuration: defaults plus named profiles
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Defaults inherited per-field by every profile
    #[serde(default)]
    pub defaults: SyncDefaults,
    /// Named profiles; pods select one via the profile annotation.
    /// At least one profile is required.
    pub profiles: BTreeMap<String, ProfileSpec>,
}

/// Per-field defaults for profiles
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncDefaults {
    /// Doublestar globs excluded from staging and protected from orphan
    /// cleanup. `**/.resources/**` is always enforced by the engine whether
    /// or not it is listed here.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Template variables available to mapping paths, templated files, and
    /// patch values. Keys must be simple identifiers.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Agent sync loop period in seconds, within [5, 3600]
    /// Default: 300
    #[serde(default = "default_sync_period")]
    #[schemars(range(min = 5, max = 3600))]
    pub sync_period: u64,
    /// What to do when designer sessions are active on the gateway
    /// Default: proceed
    #[serde(default)]
    pub designer_session_policy: DesignerSessionPolicy,
    /// Report the diff without touching the live tree
    #[serde(default)]
    pub dry_run: bool,
    /// Pause syncing for profiles that do not override this
    #[serde(default)]
    pub paused: bool,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            vars: BTreeMap::new(),
            sync_period: default_sync_period(),
            designer_session_policy: DesignerSessionPolicy::default(),
            dry_run: false,
            paused: false,
        }
    }
}

/// Designer session handling policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DesignerSessionPolicy {
    /// Sync regardless of open designer sessions
    #[default]
    Proceed,
    /// Wait for sessions to close, then sync; fail after the wait timeout
    Wait,
    /// Fail the sync immediately while sessions are open
    Fail,
}

/// A named bundle of mappings with inheritable defaults
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Ordered source-to-destination mappings; later mappings overlay
    /// earlier ones at the same destination path
    pub mappings: Vec<MappingSpec>,
    /// Additional exclude globs merged with the defaults
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Additional vars merged with the defaults (profile wins on conflict)
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Override of defaults.syncPeriod
    #[serde(default)]
    #[schemars(range(min = 5, max = 3600))]
    pub sync_period: Option<u64>,
    /// Override of defaults.dryRun
    #[serde(default)]
    pub dry_run: Option<bool>,
    /// Override of defaults.designerSessionPolicy
    #[serde(default)]
    pub designer_session_policy: Option<DesignerSessionPolicy>,
    /// Override of defaults.paused
    #[serde(default)]
    pub paused: Option<bool>,
}

/// One source-to-destination rule inside a profile
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappingSpec {
    /// Path within the repository checkout; may contain template variables
    pub source: String,
    /// Path relative to the gateway data directory; may contain template
    /// variables
    pub destination: String,
    /// Optional hint; inferred from the filesystem when unset, validated
    /// against it when set
    #[serde(default)]
    pub r#type: Option<MappingType>,
    /// Fail the profile when the resolved source does not exist
    /// Default: true
    #[serde(default = "default_true")]
    pub required: bool,
    /// Render regular files under this mapping through the template engine
    #[serde(default)]
    pub template: bool,
    /// JSON field assignments applied after staging
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

/// Mapping source kind hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    /// Source is a directory copied recursively
    Dir,
    /// Source is a single file
    File,
}

/// JSON field assignments applied to staged files within one mapping
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    /// Doublestar glob relative to the mapping destination selecting the
    /// files to patch. Omitted: the base filename for file mappings.
    #[serde(default)]
    pub file: Option<String>,
    /// Dot-path to value assignments; values may contain template variables
    /// and are decoded with JSON type inference (bare true/false/numbers
    /// become native types, everything else is stored as a string)
    pub set: BTreeMap<String, String>,
}

/// Agent container overrides
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentOverrides {
    /// Agent image; overridden per-pod by the agent-image annotation
    #[serde(default)]
    pub image: Option<String>,
    /// Agent container resources
    #[serde(default)]
    pub resources: Option<AgentResources>,
}

/// Resource requests/limits for the agent container
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentResources {
    /// Resource requests (e.g. cpu: "50m", memory: "64Mi")
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    /// Resource limits
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Default value for git ref
pub fn default_git_ref() -> String {
    "main".to_string()
}

/// Default value for the gateway HTTP port
pub fn default_gateway_port() -> u16 {
    8088
}

/// Default key for the gateway API key secret
pub fn default_api_secret_key() -> String {
    "apiKey".to_string()
}

/// Default value for the polling interval
pub fn default_polling_interval() -> String {
    "5m".to_string()
}

/// Default value for syncPeriod (seconds)
pub fn default_sync_period() -> u64 {
    300
}

/// Default value for boolean true
pub fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_fill_in() {
        let yaml = r#"
git:
  repo: https://example.com/config.git
gateway:
  api:
    secretName: gateway-api-key
sync:
  profiles:
    default:
      mappings:
        - source: projects
          destination: projects
"#;
        let spec: GatewaySyncSpec = serde_yaml::from_str(yaml).expect("spec parses");
        assert_eq!(spec.git.r#ref, "main");
        assert!(spec.git.auth.is_none());
        assert_eq!(spec.gateway.port, 8088);
        assert!(!spec.gateway.tls);
        assert_eq!(spec.gateway.api.secret_key, "apiKey");
        assert!(spec.polling.enabled);
        assert_eq!(spec.polling.interval, "5m");
        assert_eq!(spec.sync.defaults.sync_period, 300);
        assert!(!spec.paused);

        let profile = spec.sync.profiles.get("default").expect("profile present");
        let mapping = &profile.mappings[0];
        assert!(mapping.required);
        assert!(!mapping.template);
        assert!(mapping.patches.is_empty());
        assert!(mapping.r#type.is_none());
    }

    #[test]
    fn auth_schemes_are_tagged() {
        let token: GitAuthSpec = serde_yaml::from_str(
            r#"
type: token
secretRef:
  name: git-credentials
"#,
        )
        .expect("token auth parses");
        assert!(matches!(token, GitAuthSpec::Token { .. }));

        let app: GitAuthSpec = serde_yaml::from_str(
            r#"
type: githubApp
appId: 12345
installationId: 67890
pemRef:
  name: stoker-github-app
"#,
        )
        .expect("github app auth parses");
        match app {
            GitAuthSpec::GithubApp {
                app_id,
                installation_id,
                api_base_url,
                ..
            } => {
                assert_eq!(app_id, 12345);
                assert_eq!(installation_id, 67890);
                assert!(api_base_url.is_none());
            }
            other => panic!("unexpected auth variant: {other:?}"),
        }
    }

    #[test]
    fn designer_policy_lowercase_wire_format() {
        let policy: DesignerSessionPolicy = serde_json::from_str("\"wait\"").expect("parses");
        assert_eq!(policy, DesignerSessionPolicy::Wait);
        assert_eq!(
            serde_json::to_string(&DesignerSessionPolicy::Fail).expect("serializes"),
            "\"fail\""
        );
    }
}

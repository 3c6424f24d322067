//! # Controller Configuration
//!
//! Flags come from the CLI; shared secrets and defaults come from the
//! environment so they can be projected from Kubernetes secrets without
//! appearing in `ps` output.

use clap::Parser;

/// Built-in agent image used when neither the pod annotation, the resource
/// spec, nor `DEFAULT_AGENT_IMAGE` provides one
pub const BUILTIN_AGENT_IMAGE: &str = "ghcr.io/stoker-dev/stoker-agent:latest";

/// Command-line flags for the controller binary
#[derive(Debug, Clone, Parser)]
#[command(name = "controller", about = "Stoker gateway sync controller")]
pub struct Args {
    /// Enable lease-based leader election
    #[arg(long, default_value_t = false)]
    pub leader_elect: bool,

    /// Bind address for the metrics/health server
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_addr: String,

    /// Port for the pod admission webhook
    #[arg(long, default_value_t = 9443)]
    pub webhook_port: u16,

    /// Port for the push-event receiver
    #[arg(long, default_value_t = 8087)]
    pub receiver_port: u16,

    /// Human-friendly log output for local development
    #[arg(long, default_value_t = false)]
    pub log_dev: bool,
}

/// Environment-derived settings, read once at startup
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Agent image default injected when nothing more specific is set
    pub default_agent_image: Option<String>,
    /// Shared HMAC secret for the push receiver
    pub webhook_hmac_secret: Option<String>,
    /// Bearer token accepted by the push receiver in parallel with HMAC
    pub webhook_bearer_token: Option<String>,
    /// Require the namespace injection label in addition to the pod
    /// annotation
    pub strict_namespace_labels: bool,
}

impl ControllerConfig {
    /// Read the environment
    #[must_use]
    pub fn from_env() -> Self {
        let optional = |key: &str| -> Option<String> {
            std::env::var(key).ok().filter(|value| !value.is_empty())
        };
        Self {
            default_agent_image: optional("DEFAULT_AGENT_IMAGE"),
            webhook_hmac_secret: optional("WEBHOOK_HMAC_SECRET"),
            webhook_bearer_token: optional("WEBHOOK_BEARER_TOKEN"),
            strict_namespace_labels: optional("STRICT_NAMESPACE_LABELS")
                .is_some_and(|value| value == "true"),
        }
    }
}

//! # Agent Configuration
//!
//! The agent takes no flags; everything arrives through the environment,
//! wired by the admission mutator.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default repository checkout path inside the agent container
pub const DEFAULT_REPO_PATH: &str = "/repo";
/// Default gateway data directory mount
pub const DEFAULT_DATA_PATH: &str = "/ignition-data";

/// Fully parsed agent environment
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub pod_name: String,
    pub pod_namespace: String,
    pub gateway_name: String,
    pub cr_name: String,
    pub cr_namespace: String,
    pub repo_path: PathBuf,
    pub data_path: PathBuf,
    pub gateway_port: u16,
    pub gateway_tls: bool,
    pub api_key_file: PathBuf,
    pub git_token_file: Option<PathBuf>,
    pub git_ssh_key_file: Option<PathBuf>,
    pub git_known_hosts_file: Option<PathBuf>,
    pub profile: String,
    pub sync_period: Duration,
    /// Ref override from the pod annotation, projected via the downward API
    pub ref_override: Option<String>,
    pub health_port: u16,
}

impl AgentConfig {
    /// Read the environment; missing identity variables are fatal
    pub fn from_env() -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            std::env::var(key).with_context(|| format!("missing required env var {key}"))
        };
        let optional = |key: &str| -> Option<String> {
            std::env::var(key).ok().filter(|value| !value.is_empty())
        };

        let pod_name = required("POD_NAME")?;
        let pod_namespace = required("POD_NAMESPACE")?;
        let gateway_name = optional("GATEWAY_NAME").unwrap_or_else(|| pod_name.clone());
        let cr_name = required("CR_NAME")?;
        let cr_namespace = optional("CR_NAMESPACE").unwrap_or_else(|| pod_namespace.clone());

        let gateway_port = optional("GATEWAY_PORT")
            .map(|value| value.parse::<u16>())
            .transpose()
            .context("GATEWAY_PORT must be a port number")?
            .unwrap_or(8088);
        let gateway_tls = optional("GATEWAY_TLS").is_some_and(|value| value == "true");

        let sync_period = parse_period(optional("SYNC_PERIOD").as_deref())?;

        Ok(Self {
            pod_name,
            pod_namespace,
            gateway_name,
            cr_name,
            cr_namespace,
            repo_path: optional("REPO_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_REPO_PATH), PathBuf::from),
            data_path: optional("DATA_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_DATA_PATH), PathBuf::from),
            gateway_port,
            gateway_tls,
            api_key_file: required("API_KEY_FILE").map(PathBuf::from)?,
            git_token_file: optional("GIT_TOKEN_FILE").map(PathBuf::from),
            git_ssh_key_file: optional("GIT_SSH_KEY_FILE").map(PathBuf::from),
            git_known_hosts_file: optional("GIT_KNOWN_HOSTS_FILE").map(PathBuf::from),
            profile: optional("PROFILE").unwrap_or_else(|| "default".to_string()),
            sync_period,
            ref_override: optional("REF_OVERRIDE"),
            health_port: optional("HEALTH_PORT")
                .map(|value| value.parse::<u16>())
                .transpose()
                .context("HEALTH_PORT must be a port number")?
                .unwrap_or(stoker_api::AGENT_HEALTH_PORT),
        })
    }

    /// Gateway base URL; the gateway shares the pod network namespace
    #[must_use]
    pub fn gateway_base_url(&self) -> String {
        let scheme = if self.gateway_tls { "https" } else { "http" };
        format!("{scheme}://127.0.0.1:{}", self.gateway_port)
    }
}

/// Sync period: plain seconds ("300") or a humantime form ("5m")
fn parse_period(raw: Option<&str>) -> Result<Duration> {
    match raw {
        None => Ok(Duration::from_secs(300)),
        Some(raw) => {
            if let Ok(secs) = raw.parse::<u64>() {
                return Ok(Duration::from_secs(secs));
            }
            humantime::parse_duration(raw)
                .with_context(|| format!("SYNC_PERIOD '{raw}' is not a duration"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_accepts_seconds_and_humantime() {
        assert_eq!(parse_period(Some("300")).unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period(Some("5m")).unwrap(), Duration::from_secs(300));
        assert_eq!(parse_period(None).unwrap(), Duration::from_secs(300));
        assert!(parse_period(Some("soon")).is_err());
    }
}

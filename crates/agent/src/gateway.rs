//! # Gateway API Client
//!
//! Thin client for the gateway's scan and designer-session endpoints. All
//! calls carry the `X-Ignition-API-Token` header read from the mounted API
//! key file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Header carrying `<name>:<secret>`
pub const API_TOKEN_HEADER: &str = "X-Ignition-API-Token";

/// One active designer session as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignerSession {
    #[serde(default, alias = "user", alias = "username")]
    pub owner: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

/// The session endpoint answers either a bare array or a wrapper object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DesignerSessionInfo {
    Wrapped { sessions: Vec<DesignerSession> },
    Bare(Vec<DesignerSession>),
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    api_token: String,
    client: reqwest::Client,
}

impl GatewayClient {
    /// Build a client for the given base URL, reading the API token from
    /// the mounted file
    pub fn new(base_url: String, api_key_file: &Path) -> Result<Self> {
        let api_token = std::fs::read_to_string(api_key_file)
            .with_context(|| format!("reading API key file {}", api_key_file.display()))?
            .trim()
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .context("building gateway HTTP client")?;
        Ok(Self {
            base_url,
            api_token,
            client,
        })
    }

    /// Client with an explicit token (tests)
    #[must_use]
    pub fn with_token(base_url: String, api_token: String) -> Self {
        Self {
            base_url,
            api_token,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        self.client
            .get(&url)
            .header(API_TOKEN_HEADER, &self.api_token)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))
    }

    /// Ask the gateway to rescan projects; non-2xx is an error
    pub async fn scan_projects(&self) -> Result<()> {
        let response = self.get("/scan/projects").await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("project scan returned {status}");
        }
        debug!("project scan ok");
        Ok(())
    }

    /// Ask the gateway to rescan config; non-2xx is an error
    pub async fn scan_config(&self) -> Result<()> {
        let response = self.get("/scan/config").await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("config scan returned {status}");
        }
        debug!("config scan ok");
        Ok(())
    }

    /// Active designer sessions
    pub async fn designer_sessions(&self) -> Result<Vec<DesignerSession>> {
        let response = self.get("/data/designer-session-info").await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("designer session query returned {status}");
        }
        let info: DesignerSessionInfo = response
            .json()
            .await
            .context("parsing designer session response")?;
        Ok(match info {
            DesignerSessionInfo::Wrapped { sessions } | DesignerSessionInfo::Bare(sessions) => {
                sessions
            }
        })
    }

    /// Whether the gateway answers its scan endpoint at all (used by the
    /// post-commission resync)
    pub async fn is_responsive(&self) -> bool {
        match self.get("/scan/projects").await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Describe sessions for an error message, naming owner and project
#[must_use]
pub fn describe_sessions(sessions: &[DesignerSession]) -> String {
    let parts: Vec<String> = sessions
        .iter()
        .map(|session| {
            format!(
                "{}@{}",
                session.owner.as_deref().unwrap_or("unknown"),
                session.project.as_deref().unwrap_or("unknown")
            )
        })
        .collect();
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn scan_carries_the_api_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scan/projects"))
            .and(header(API_TOKEN_HEADER, "agent:s3cret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::with_token(server.uri(), "agent:s3cret".to_string());
        client.scan_projects().await.expect("scan succeeds");
    }

    #[tokio::test]
    async fn non_2xx_scan_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scan/config"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = GatewayClient::with_token(server.uri(), "t".to_string());
        let err = client.scan_config().await.expect_err("must fail");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn designer_sessions_accept_both_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/designer-session-info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sessions": [{"owner": "amy", "project": "plant"}]
            })))
            .mount(&server)
            .await;

        let client = GatewayClient::with_token(server.uri(), "t".to_string());
        let sessions = client.designer_sessions().await.expect("parses");
        assert_eq!(sessions.len(), 1);
        assert_eq!(describe_sessions(&sessions), "amy@plant");
    }
}

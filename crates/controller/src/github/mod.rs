//! # GitHub App Token Broker
//!
//! Exchanges a GitHub App private key for short-lived installation access
//! tokens. Tokens are cached per resource and refreshed five minutes before
//! expiry; concurrent reconciles of the same resource serialize on a keyed
//! single-flight lock so only one exchange hits the API.
//!
//! The PEM never leaves this process: agents mount only the derived token
//! secret that the reconciler writes from the broker's output.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Default API base URL; overridable per resource for GitHub Enterprise
pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

/// Refresh tokens this long before they expire
const REFRESH_MARGIN: ChronoDuration = ChronoDuration::minutes(5);
/// JWT clock-skew allowance: issued-at backdated by this much
const JWT_BACKDATE_SECS: i64 = 60;
/// JWT lifetime from now (stays under GitHub's 10 minute cap)
const JWT_LIFETIME_SECS: i64 = 540;

/// Exchange failure; each variant maps to a GitHubAppExchangeFailed reason
#[derive(Debug, Error)]
pub enum TokenExchangeError {
    #[error("private key PEM could not be parsed: {0}")]
    PemParse(String),

    #[error("installation {installation_id} not found")]
    MissingInstallation { installation_id: i64 },

    #[error("exchange rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("exchange request failed: {0}")]
    Network(String),
}

impl TokenExchangeError {
    /// Stable condition reason
    #[must_use]
    pub fn condition_reason(&self) -> &'static str {
        match self {
            Self::PemParse(_) => "PemParseFailed",
            Self::MissingInstallation { .. } => "MissingInstallation",
            Self::Rejected { status: 401, .. } => "ClockSkew",
            Self::Rejected { .. } => "ExchangeRejected",
            Self::Network(_) => "ExchangeUnreachable",
        }
    }
}

/// GitHub App coordinates for one resource
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_id: i64,
    pub installation_id: i64,
    pub api_base_url: Option<String>,
}

/// A minted installation token
#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl InstallationToken {
    /// Whether the token is still comfortably inside its lifetime
    #[must_use]
    pub fn fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - REFRESH_MARGIN
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Per-resource token cache with single-flight exchange
pub struct TokenBroker {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, InstallationToken>>,
    // Keyed locks serialize concurrent exchanges per resource
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.cache.lock().map(|cache| cache.len()).unwrap_or(0);
        f.debug_struct("TokenBroker")
            .field("cached_tokens", &cached)
            .finish_non_exhaustive()
    }
}

impl Default for TokenBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return a fresh installation token for `key` (resource identity),
    /// exchanging only on cache miss or near-expiry
    pub async fn token_for(
        &self,
        key: &str,
        config: &AppConfig,
        pem: &[u8],
    ) -> Result<InstallationToken, TokenExchangeError> {
        if let Some(token) = self.cached(key) {
            debug!(key, "serving cached installation token");
            return Ok(token);
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        // Another reconcile may have exchanged while we waited on the lock
        if let Some(token) = self.cached(key) {
            debug!(key, "token refreshed while waiting on single-flight lock");
            return Ok(token);
        }

        let token = self.exchange(config, pem).await;
        match &token {
            Ok(token) => {
                crate::observability::metrics::increment_token_exchanges("success");
                info!(
                    key,
                    expires_at = token.expires_at.to_rfc3339().as_str(),
                    "installation token exchanged"
                );
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(key.to_string(), token.clone());
                }
            }
            Err(e) => {
                crate::observability::metrics::increment_token_exchanges(e.condition_reason());
                warn!(key, error = %e, "installation token exchange failed");
            }
        }
        token
    }

    /// Drop the cached token for a resource (called when the resource goes
    /// away or its auth config changes)
    pub fn forget(&self, key: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(key);
        }
    }

    fn cached(&self, key: &str) -> Option<InstallationToken> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(key)
            .filter(|token| token.fresh_at(Utc::now()))
            .cloned()
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poison| poison.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn exchange(
        &self,
        config: &AppConfig,
        pem: &[u8],
    ) -> Result<InstallationToken, TokenExchangeError> {
        let jwt = sign_app_jwt(config.app_id, pem, Utc::now())?;
        let base = config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE_URL)
            .trim_end_matches('/');
        let url = format!(
            "{base}/app/installations/{}/access_tokens",
            config.installation_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "stoker-controller")
            .send()
            .await
            .map_err(|e| TokenExchangeError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TokenExchangeError::MissingInstallation {
                installation_id: config.installation_id,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TokenExchangeError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| TokenExchangeError::Network(format!("parsing exchange response: {e}")))?;
        Ok(InstallationToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }

    /// Test hook: seed the cache with a token at a chosen expiry
    #[doc(hidden)]
    pub fn seed(&self, key: &str, token: InstallationToken) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), token);
        }
    }
}

/// Sign the App JWT: `iat = now - 60s`, `exp = now + 540s`, `iss = appId`,
/// RS256
fn sign_app_jwt(
    app_id: i64,
    pem: &[u8],
    now: DateTime<Utc>,
) -> Result<String, TokenExchangeError> {
    let key = EncodingKey::from_rsa_pem(pem)
        .map_err(|e| TokenExchangeError::PemParse(e.to_string()))?;
    let claims = AppClaims {
        iat: now.timestamp() - JWT_BACKDATE_SECS,
        exp: now.timestamp() + JWT_LIFETIME_SECS,
        iss: app_id.to_string(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| TokenExchangeError::PemParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate, Respond};

    // 2048-bit throwaway key used only by these tests
    const TEST_PEM: &str = include_str!("testdata/test-app-key.pem");

    fn app_config(server: &MockServer) -> AppConfig {
        AppConfig {
            app_id: 12345,
            installation_id: 678,
            api_base_url: Some(server.uri()),
        }
    }

    #[test]
    fn jwt_claim_windows_match_the_exchange_contract() {
        let now = Utc::now();
        let jwt = sign_app_jwt(12345, TEST_PEM.as_bytes(), now).expect("signs");
        // Decode the payload without verifying the signature
        let payload = jwt.split('.').nth(1).expect("payload segment");
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .expect("decodes");
        let claims: serde_json::Value = serde_json::from_slice(&decoded).expect("json");
        assert_eq!(claims["iss"], "12345");
        assert_eq!(claims["iat"].as_i64(), Some(now.timestamp() - 60));
        assert_eq!(claims["exp"].as_i64(), Some(now.timestamp() + 540));
    }

    #[test]
    fn bad_pem_is_a_parse_error() {
        let err = sign_app_jwt(1, b"not a pem", Utc::now()).expect_err("must fail");
        assert!(matches!(err, TokenExchangeError::PemParse(_)));
        assert_eq!(err.condition_reason(), "PemParseFailed");
    }

    #[tokio::test]
    async fn exchange_hits_the_installation_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/678/access_tokens"))
            .and(header("Accept", "application/vnd.github+json"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "ghs_testtoken",
                "expires_at": (Utc::now() + ChronoDuration::hours(1)).to_rfc3339(),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let broker = TokenBroker::new();
        let token = broker
            .token_for("ns/cr", &app_config(&server), TEST_PEM.as_bytes())
            .await
            .expect("exchanges");
        assert_eq!(token.token, "ghs_testtoken");
    }

    #[tokio::test]
    async fn cache_serves_until_the_refresh_margin() {
        let server = MockServer::start().await;
        // No mock mounted: a request would 404 and fail the test
        let broker = TokenBroker::new();
        broker.seed(
            "ns/cr",
            InstallationToken {
                token: "cached".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            },
        );
        let token = broker
            .token_for("ns/cr", &app_config(&server), TEST_PEM.as_bytes())
            .await
            .expect("served from cache");
        assert_eq!(token.token, "cached");
    }

    #[tokio::test]
    async fn near_expiry_token_is_re_exchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/678/access_tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "rotated",
                "expires_at": (Utc::now() + ChronoDuration::hours(1)).to_rfc3339(),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let broker = TokenBroker::new();
        // Two minutes out is inside the five-minute refresh margin
        broker.seed(
            "ns/cr",
            InstallationToken {
                token: "stale".to_string(),
                expires_at: Utc::now() + ChronoDuration::minutes(2),
            },
        );
        let token = broker
            .token_for("ns/cr", &app_config(&server), TEST_PEM.as_bytes())
            .await
            .expect("re-exchanges");
        assert_eq!(token.token, "rotated");
    }

    struct CountingResponder(Arc<AtomicUsize>);

    impl Respond for CountingResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.0.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "token": "single-flight",
                "expires_at": (Utc::now() + ChronoDuration::hours(1)).to_rfc3339(),
            }))
        }
    }

    #[tokio::test]
    async fn concurrent_calls_produce_exactly_one_exchange() {
        let server = MockServer::start().await;
        let count = Arc::new(AtomicUsize::new(0));
        Mock::given(method("POST"))
            .and(path("/app/installations/678/access_tokens"))
            .respond_with(CountingResponder(count.clone()))
            .mount(&server)
            .await;

        let broker = Arc::new(TokenBroker::new());
        let config = app_config(&server);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                broker
                    .token_for("ns/cr", &config, TEST_PEM.as_bytes())
                    .await
                    .expect("exchanges")
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join").token, "single-flight");
        }
        assert_eq!(count.load(Ordering::SeqCst), 1, "exactly one remote exchange");
    }

    #[tokio::test]
    async fn missing_installation_maps_to_its_own_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let broker = TokenBroker::new();
        let err = broker
            .token_for("ns/cr", &app_config(&server), TEST_PEM.as_bytes())
            .await
            .expect_err("must fail");
        assert!(matches!(err, TokenExchangeError::MissingInstallation { .. }));
        assert_eq!(err.condition_reason(), "MissingInstallation");
    }

    #[tokio::test]
    async fn unauthorized_exchange_reads_as_clock_skew() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_string("'Expiration time' claim is too far in the future"),
            )
            .mount(&server)
            .await;

        let broker = TokenBroker::new();
        let err = broker
            .token_for("ns/cr", &app_config(&server), TEST_PEM.as_bytes())
            .await
            .expect_err("must fail");
        assert_eq!(err.condition_reason(), "ClockSkew");
    }
}

//! # Push-Event Receiver
//!
//! `POST /webhook/{namespace}/{crName}` converts heterogeneous push
//! notifications (GitHub releases, ArgoCD, Kargo, or a generic `{"ref"}`
//! payload) into a single annotation write on the target resource. The
//! controller's watch picks the annotation up like any other change.
//!
//! Authentication happens before any Kubernetes read so an attacker cannot
//! enumerate resource names: when an HMAC secret is configured the
//! `X-Hub-Signature-256` header is verified with a constant-time compare;
//! a bearer token scheme may be accepted in parallel, and satisfying
//! either is sufficient.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use stoker_api::{annotations, GatewaySync};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted payload: exactly 1 MiB
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared receiver state
#[derive(Clone)]
pub struct ReceiverState {
    pub client: Client,
    pub hmac_secret: Option<String>,
    pub bearer_token: Option<String>,
}

impl std::fmt::Debug for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverState")
            .field("hmac_configured", &self.hmac_secret.is_some())
            .field("bearer_configured", &self.bearer_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Build the receiver router
pub fn router(state: Arc<ReceiverState>) -> Router {
    Router::new()
        .route("/webhook/{namespace}/{cr_name}", post(handle_push))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// An extracted ref and the payload family it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRef {
    pub r#ref: String,
    pub source: &'static str,
}

/// Try each known payload shape in order
#[must_use]
pub fn extract_ref(payload: &Value) -> Option<ExtractedRef> {
    if let Some(tag) = payload
        .pointer("/release/tag_name")
        .and_then(Value::as_str)
        .filter(|tag| !tag.is_empty())
    {
        return Some(ExtractedRef {
            r#ref: tag.to_string(),
            source: "github",
        });
    }
    if let Some(reference) = payload
        .pointer("/app/metadata/annotations/git.ref")
        .and_then(Value::as_str)
        .filter(|reference| !reference.is_empty())
    {
        return Some(ExtractedRef {
            r#ref: reference.to_string(),
            source: "argocd",
        });
    }
    if let Some(tag) = payload
        .pointer("/freight/commits/0/tag")
        .and_then(Value::as_str)
        .filter(|tag| !tag.is_empty())
    {
        return Some(ExtractedRef {
            r#ref: tag.to_string(),
            source: "kargo",
        });
    }
    if let Some(reference) = payload
        .get("ref")
        .and_then(Value::as_str)
        .filter(|reference| !reference.is_empty())
    {
        return Some(ExtractedRef {
            r#ref: reference.to_string(),
            source: "generic",
        });
    }
    None
}

/// Verify `X-Hub-Signature-256: sha256=<hex>` against the raw body
#[must_use]
pub fn verify_hmac_signature(body: &[u8], signature_header: &str, secret: &str) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    // Constant-time comparison to prevent timing attacks
    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// Check the parallel bearer scheme with a constant-time compare
#[must_use]
pub fn verify_bearer(authorization: Option<&str>, expected: &str) -> bool {
    let Some(value) = authorization else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Authenticate a request; `Ok(())` when no scheme is configured at all
fn authenticate(
    hmac_secret: Option<&str>,
    bearer_token: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ()> {
    if hmac_secret.is_none() && bearer_token.is_none() {
        return Ok(());
    }
    if let Some(secret) = hmac_secret {
        if let Some(signature) = headers
            .get("x-hub-signature-256")
            .and_then(|value| value.to_str().ok())
        {
            if verify_hmac_signature(body, signature, secret) {
                return Ok(());
            }
        }
    }
    if let Some(expected) = bearer_token {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        if verify_bearer(authorization, expected) {
            return Ok(());
        }
    }
    Err(())
}

async fn handle_push(
    State(state): State<Arc<ReceiverState>>,
    Path((namespace, cr_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let response = handle_push_inner(&state, &namespace, &cr_name, &headers, &body).await;
    crate::observability::metrics::increment_webhook_requests(response.status().as_u16());
    response
}

async fn handle_push_inner(
    state: &ReceiverState,
    namespace: &str,
    cr_name: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    // Signature first: no cluster reads for unauthenticated callers
    if authenticate(
        state.hmac_secret.as_deref(),
        state.bearer_token.as_deref(),
        headers,
        body,
    )
    .is_err()
    {
        warn!(namespace, cr_name, "webhook authentication failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed"})),
        )
            .into_response();
    }

    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "payload is not valid JSON"})),
            )
                .into_response();
        }
    };
    let Some(extracted) = extract_ref(&payload) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "no ref found in payload"})),
        )
            .into_response();
    };

    let api: Api<GatewaySync> = Api::namespaced(state.client.clone(), namespace);
    let resource = match api.get_opt(cr_name).await {
        Ok(Some(resource)) => resource,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("GatewaySync {namespace}/{cr_name} not found")})),
            )
                .into_response();
        }
        Err(e) => {
            warn!(namespace, cr_name, error = %e, "resource lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "resource lookup failed"})),
            )
                .into_response();
        }
    };

    let current = annotations::get(
        resource.metadata.annotations.as_ref(),
        annotations::REQUESTED_REF,
    );
    if current == Some(extracted.r#ref.as_str()) {
        return (StatusCode::OK, Json(json!({"message": "ref already set"}))).into_response();
    }

    let patch = json!({
        "metadata": {
            "annotations": {
                annotations::REQUESTED_REF: extracted.r#ref,
                annotations::REQUESTED_AT: chrono::Utc::now().to_rfc3339(),
                annotations::REQUESTED_BY: extracted.source,
            }
        }
    });
    if let Err(e) = api
        .patch(
            cr_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        warn!(namespace, cr_name, error = %e, "annotation patch failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "annotation write failed"})),
        )
            .into_response();
    }

    info!(
        namespace,
        cr_name,
        reference = extracted.r#ref.as_str(),
        source = extracted.source,
        "push event accepted"
    );
    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "ref": extracted.r#ref})),
    )
        .into_response()
}

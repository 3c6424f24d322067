//! # Pod Admission Mutator
//!
//! Cluster-wide mutating webhook on pod create. Pods that opt in with the
//! inject annotation receive the `stoker-agent` native sidecar; everything
//! else is admitted untouched on the hot path. The mutator is stateless and
//! runs in every replica (no leader gate) so pod creation never waits on
//! failover.
//!
//! The handler stays off the pod-creation critical path: at most one
//! namespace list and one resource read, never a Git or GitHub call.

pub mod mutate;

pub use mutate::{already_injected, mutate_pod, resolve_agent_image};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use json_patch::diff;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::Client;
use std::sync::Arc;
use stoker_api::{annotations, GatewaySync};
use tracing::{debug, info, warn};

/// Default gateway data directory when no data volume is discovered
pub const DEFAULT_DATA_PATH: &str = "/ignition-data";

/// Namespaces never injected regardless of annotations
pub const EXCLUDED_NAMESPACES: [&str; 2] = ["kube-system", "kube-node-lease"];

/// Shared mutator state
#[derive(Clone)]
pub struct AdmissionState {
    pub client: Client,
    pub default_agent_image: Option<String>,
    pub strict_namespace_labels: bool,
}

impl std::fmt::Debug for AdmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionState")
            .field("default_agent_image", &self.default_agent_image)
            .field("strict_namespace_labels", &self.strict_namespace_labels)
            .finish_non_exhaustive()
    }
}

/// Build the admission router
pub fn router(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route("/mutate", post(handle_mutate))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Pure pre-checks that need no API access.
///
/// `Some(reason)` means admit unchanged; `None` means continue deciding.
#[must_use]
pub fn skip_reason(pod: &Pod, namespace: &str) -> Option<&'static str> {
    if EXCLUDED_NAMESPACES.contains(&namespace) {
        return Some("system-namespace");
    }
    if !annotations::inject_requested(pod.metadata.annotations.as_ref()) {
        return Some("not-opted-in");
    }
    if already_injected(pod) {
        return Some("already-injected");
    }
    None
}

/// Policy checks against the resolved resource.
///
/// `Err(reason)` denies the admission.
pub fn check_resource(pod: &Pod, sync: &GatewaySync) -> Result<(), String> {
    if sync.spec.paused {
        return Err(format!(
            "GatewaySync {} is paused; refusing to inject",
            sync.metadata.name.as_deref().unwrap_or_default()
        ));
    }
    if let Some(profile) = annotations::get(pod.metadata.annotations.as_ref(), annotations::PROFILE)
    {
        if !sync.spec.sync.profiles.contains_key(profile) {
            return Err(format!(
                "profile '{profile}' not present in GatewaySync {}",
                sync.metadata.name.as_deref().unwrap_or_default()
            ));
        }
    }
    Ok(())
}

async fn handle_mutate(
    State(state): State<Arc<AdmissionState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed admission review");
            crate::observability::metrics::increment_admission_reviews("invalid");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let response = decide(&state, &request).await;
    Json(response.into_review())
}

async fn decide(state: &AdmissionState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let Some(pod) = &request.object else {
        crate::observability::metrics::increment_admission_reviews("invalid");
        return AdmissionResponse::invalid("admission request carries no pod");
    };
    let namespace = request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();

    if let Some(reason) = skip_reason(pod, &namespace) {
        debug!(namespace = namespace.as_str(), reason, "admitting unchanged");
        crate::observability::metrics::increment_admission_reviews(reason);
        return response;
    }

    if state.strict_namespace_labels && !namespace_opted_in(state, &namespace).await {
        debug!(
            namespace = namespace.as_str(),
            "strict mode: namespace lacks the injection label"
        );
        crate::observability::metrics::increment_admission_reviews("namespace-not-labelled");
        return response;
    }

    let sync = match resolve_gateway_sync(state, pod, &namespace).await {
        Ok(sync) => sync,
        Err(reason) => {
            warn!(namespace = namespace.as_str(), reason = reason.as_str(), "denying pod");
            crate::observability::metrics::increment_admission_reviews("denied");
            return response.deny(reason);
        }
    };

    if let Err(reason) = check_resource(pod, &sync) {
        warn!(namespace = namespace.as_str(), reason = reason.as_str(), "denying pod");
        crate::observability::metrics::increment_admission_reviews("denied");
        return response.deny(reason);
    }

    let mutated = mutate_pod(pod, &sync, state.default_agent_image.as_deref());
    let original_value = match serde_json::to_value(pod) {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::invalid(e.to_string()),
    };
    let mutated_value = match serde_json::to_value(&mutated) {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::invalid(e.to_string()),
    };
    let patch = diff(&original_value, &mutated_value);

    info!(
        namespace = namespace.as_str(),
        pod = pod.metadata.name.as_deref()
            .or(pod.metadata.generate_name.as_deref())
            .unwrap_or("unknown"),
        resource = sync.metadata.name.as_deref().unwrap_or_default(),
        operations = patch.0.len(),
        "injecting stoker-agent"
    );
    crate::observability::metrics::increment_admission_reviews("injected");
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(e) => AdmissionResponse::invalid(e.to_string()),
    }
}

async fn namespace_opted_in(state: &AdmissionState, namespace: &str) -> bool {
    let api: Api<Namespace> = Api::all(state.client.clone());
    match api.get_opt(namespace).await {
        Ok(Some(ns)) => ns
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(annotations::INJECTION_LABEL))
            .is_some_and(|value| value == annotations::INJECTION_ENABLED),
        _ => false,
    }
}

/// Resolve the owning GatewaySync: explicit annotation first, else the
/// single resource in the namespace
async fn resolve_gateway_sync(
    state: &AdmissionState,
    pod: &Pod,
    namespace: &str,
) -> Result<GatewaySync, String> {
    let api: Api<GatewaySync> = Api::namespaced(state.client.clone(), namespace);

    if let Some(cr_name) = annotations::get(pod.metadata.annotations.as_ref(), annotations::CR_NAME)
    {
        return match api.get_opt(cr_name).await {
            Ok(Some(sync)) => Ok(sync),
            Ok(None) => Err(format!("GatewaySync '{cr_name}' not found in {namespace}")),
            Err(e) => Err(format!("GatewaySync lookup failed: {e}")),
        };
    }

    let list = api
        .list(&ListParams::default())
        .await
        .map_err(|e| format!("GatewaySync list failed: {e}"))?;
    match list.items.len() {
        0 => Err(format!(
            "no GatewaySync in namespace {namespace}; set the {} annotation or create one",
            annotations::CR_NAME
        )),
        1 => Ok(list.items.into_iter().next().expect("length checked")),
        n => Err(format!(
            "{n} GatewaySync resources in namespace {namespace}; disambiguate with the {} annotation",
            annotations::CR_NAME
        )),
    }
}

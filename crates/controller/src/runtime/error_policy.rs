//! # Error Policy
//!
//! Reconciliation errors land here, outside the work unit, so a failing
//! resource backs off on its own Fibonacci schedule without blocking the
//! watch or the other resources.

use crate::observability::metrics;
use crate::reconciler::{BackoffState, Reconciler, ReconcilerError};
use kube_runtime::controller::Action;
use std::sync::Arc;
use stoker_api::GatewaySync;
use tracing::{error, info, warn};

/// Compute the retry action for a failed work unit
pub fn handle_reconciliation_error(
    sync: Arc<GatewaySync>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = sync.metadata.name.as_deref().unwrap_or("unknown");
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");

    error!(
        resource.name = name,
        resource.namespace = namespace,
        error = %error,
        "reconciliation error"
    );
    metrics::increment_reconciliation_errors();

    // Backoff state is tracked per resource to avoid cross-resource
    // interference
    let key = Reconciler::resource_key(namespace, name);
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key).or_insert_with(BackoffState::new);
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("failed to lock backoff state: {e}, using default backoff");
            (60, 0)
        }
    };

    info!(
        resource.name = name,
        backoff_seconds,
        error_count,
        "retrying with Fibonacci backoff"
    );
    metrics::increment_requeues_total("error-backoff");
    Action::requeue(std::time::Duration::from_secs(backoff_seconds))
}

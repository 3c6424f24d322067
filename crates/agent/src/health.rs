//! # Health Server
//!
//! Probe endpoints the mutator wires the agent container's startup,
//! liveness, and readiness probes to.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared probe state flipped by the run loop
#[derive(Debug, Default)]
pub struct HealthState {
    /// Set once the first metadata record has been read
    pub started: AtomicBool,
    /// Set while the run loop is live and able to sync
    pub ready: AtomicBool,
}

pub async fn start_health_server(port: u16, state: Arc<HealthState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz/startup", get(startup_handler))
        .route("/healthz/live", get(live_handler))
        .route("/healthz/ready", get(ready_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("health server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn startup_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.started.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn live_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

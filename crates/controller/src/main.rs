//! # Controller Entrypoint
//!
//! Startup order matters: rustls provider first, then tracing, then
//! metrics, then the HTTP surfaces. The admission mutator serves in every
//! replica; the reconciler and push receiver wait for leadership when
//! `--leader-elect` is set.

use anyhow::{Context, Result};
use clap::Parser;
use controller::admission::AdmissionState;
use controller::config::{Args, ControllerConfig};
use controller::receiver::ReceiverState;
use controller::reconciler::Reconciler;
use controller::runtime::leader::LeaderElector;
use controller::runtime::watch_loop::run_watch_loop;
use controller::server::{start_server, ServerState};
use kube::Client;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Receiver drain window on shutdown
const RECEIVER_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider FIRST, before any other operations
    // Required for rustls 0.23+ when no default provider is set via features
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    let args = Args::parse();
    init_tracing(args.log_dev);
    controller::observability::metrics::register_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        leader_elect = args.leader_elect,
        "stoker controller starting"
    );

    let config = ControllerConfig::from_env();
    let client = Client::try_default()
        .await
        .context("building Kubernetes client")?;
    let controller_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "stoker-system".to_string());

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(true)),
    });

    // Metrics and probes
    {
        let state = server_state.clone();
        let addr = args.metrics_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = start_server(&addr, state).await {
                tracing::error!(error = %e, "metrics server exited");
            }
        });
    }

    // Admission mutator: every replica, no leader gate, its latency sits on
    // the pod-creation path
    {
        let admission_state = Arc::new(AdmissionState {
            client: client.clone(),
            default_agent_image: config.default_agent_image.clone(),
            strict_namespace_labels: config.strict_namespace_labels,
        });
        let router = controller::admission::router(admission_state);
        let addr = format!("0.0.0.0:{}", args.webhook_port);
        tokio::spawn(async move {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("admission webhook listening on {addr}");
                    if let Err(e) = axum::serve(listener, router).await {
                        tracing::error!(error = %e, "admission server exited");
                    }
                }
                Err(e) => tracing::error!(error = %e, "binding admission webhook failed"),
            }
        });
    }

    // Leader election gates the writers
    if args.leader_elect {
        let identity = std::env::var("POD_NAME")
            .unwrap_or_else(|_| format!("stoker-controller-{}", std::process::id()));
        let elector = LeaderElector::new(client.clone(), &controller_namespace, identity);
        elector.acquire().await?;
        tokio::spawn(elector.renew_loop());
    }

    // Push receiver: leader only, drains with a short grace period
    {
        let receiver_state = Arc::new(ReceiverState {
            client: client.clone(),
            hmac_secret: config.webhook_hmac_secret.clone(),
            bearer_token: config.webhook_bearer_token.clone(),
        });
        let router = controller::receiver::router(receiver_state);
        let addr = format!("0.0.0.0:{}", args.receiver_port);
        tokio::spawn(async move {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("push receiver listening on {addr}");
                    let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                        let _ = tokio::signal::ctrl_c().await;
                        tokio::time::sleep(RECEIVER_GRACE).await;
                    });
                    if let Err(e) = serve.await {
                        tracing::error!(error = %e, "receiver server exited");
                    }
                }
                Err(e) => tracing::error!(error = %e, "binding push receiver failed"),
            }
        });
    }

    let reconciler = Arc::new(Reconciler::new(client.clone(), controller_namespace)?);
    run_watch_loop(client, reconciler, server_state).await
}

fn init_tracing(log_dev: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log_dev {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

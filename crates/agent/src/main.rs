//! # Agent Entrypoint
//!
//! No flags; configuration arrives entirely through the environment wired
//! by the admission mutator.

use anyhow::Result;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider FIRST, before any other operations
    // Required for rustls 0.23+ when no default provider is set via features
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = agent::config::AgentConfig::from_env()?;
    info!(
        version = agent::AGENT_VERSION,
        pod = config.pod_name.as_str(),
        resource = config.cr_name.as_str(),
        "stoker agent starting"
    );

    agent::run::run(config).await
}

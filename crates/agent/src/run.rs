//! # Agent Run Loop
//!
//! Single cooperative loop with three side tasks: the health server, a
//! metadata poller, and a one-shot post-commission resync. A bounded
//! channel of capacity 1 coalesces triggers so bursts collapse into one
//! extra cycle.

use crate::config::AgentConfig;
use crate::gateway::{describe_sessions, GatewayClient};
use crate::git::{ensure_checkout, GitAuthFiles};
use crate::health::{start_health_server, HealthState};
use crate::metadata::{fetch_metadata, poll_metadata};
use crate::plan::{build_plan, build_vars};
use crate::status::publish_status;
use crate::sync::{self, SyncResult};
use anyhow::{bail, Context, Result};
use kube::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stoker_api::crd::DesignerSessionPolicy;
use stoker_api::GatewayStatusRecord;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Why a cycle started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Sync period elapsed
    Periodic,
    /// Metadata record content changed
    MetadataChanged,
    /// Gateway just became responsive after commissioning
    PostCommission,
}

/// How long the metadata poller sleeps between reads
const METADATA_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Designer `wait` policy: total wait and probe interval
const DESIGNER_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
const DESIGNER_WAIT_PROBE: Duration = Duration::from_secs(5);

/// What a successful cycle produced
#[derive(Debug)]
enum CycleOutcome {
    /// Resource or profile paused; nothing done
    Paused,
    /// Plan executed
    Applied {
        commit: String,
        synced_ref: String,
        result: SyncResult,
        scan_result: String,
        dry_run: bool,
    },
}

/// Run the agent until shutdown
pub async fn run(config: AgentConfig) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("building Kubernetes client")?;
    let gateway = GatewayClient::new(config.gateway_base_url(), &config.api_key_file)?;
    let health = Arc::new(HealthState::default());

    tokio::spawn({
        let health = health.clone();
        let port = config.health_port;
        async move {
            if let Err(e) = start_health_server(port, health).await {
                error!(error = %e, "health server exited");
            }
        }
    });

    let (tx, mut rx) = mpsc::channel::<Trigger>(1);

    tokio::spawn(poll_metadata(
        client.clone(),
        config.cr_namespace.clone(),
        config.cr_name.clone(),
        METADATA_POLL_INTERVAL,
        tx.clone(),
    ));

    tokio::spawn(post_commission_resync(gateway.clone(), tx.clone()));

    info!(
        gateway = config.gateway_name.as_str(),
        profile = config.profile.as_str(),
        period = ?config.sync_period,
        "agent started"
    );

    let mut ticker = tokio::time::interval(config.sync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let trigger = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => Trigger::Periodic,
            received = rx.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
        };
        run_cycle(&config, &client, &gateway, &health, trigger).await;
        health.ready.store(true, Ordering::Relaxed);
    }

    Ok(())
}

/// One sync cycle: never propagates errors, always publishes a record
async fn run_cycle(
    config: &AgentConfig,
    client: &Client,
    gateway: &GatewayClient,
    health: &Arc<HealthState>,
    trigger: Trigger,
) {
    info!(?trigger, "sync cycle starting");
    let started = Instant::now();

    let record = match sync_once(config, client, gateway, health).await {
        Ok(CycleOutcome::Paused) => {
            info!("sync paused, skipping");
            return;
        }
        Ok(CycleOutcome::Applied {
            commit,
            synced_ref,
            result,
            scan_result,
            dry_run,
        }) => {
            info!(
                commit = commit.as_str(),
                added = result.files_added,
                modified = result.files_modified,
                deleted = result.files_deleted,
                dry_run,
                "sync cycle complete"
            );
            GatewayStatusRecord {
                gateway: config.gateway_name.clone(),
                pod_name: config.pod_name.clone(),
                profile: config.profile.clone(),
                sync_status: "Synced".to_string(),
                synced_commit: Some(commit),
                synced_ref: Some(synced_ref),
                last_sync_time: Some(chrono::Utc::now().to_rfc3339()),
                last_sync_duration: Some(format!("{:.2}s", started.elapsed().as_secs_f64())),
                agent_version: Some(crate::AGENT_VERSION.to_string()),
                last_scan_result: Some(scan_result),
                files_changed: i32::try_from(result.files_changed()).ok(),
                projects_synced: result.projects_synced,
                message: None,
            }
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "sync cycle failed");
            GatewayStatusRecord {
                gateway: config.gateway_name.clone(),
                pod_name: config.pod_name.clone(),
                profile: config.profile.clone(),
                sync_status: "Error".to_string(),
                synced_ref: config.ref_override.clone(),
                last_sync_time: Some(chrono::Utc::now().to_rfc3339()),
                agent_version: Some(crate::AGENT_VERSION.to_string()),
                message: Some(format!("{e:#}")),
                ..Default::default()
            }
        }
    };

    if let Err(e) = publish_status(client, &config.cr_namespace, &config.cr_name, &record).await {
        warn!(error = format!("{e:#}"), "publishing status record failed");
    }
}

async fn sync_once(
    config: &AgentConfig,
    client: &Client,
    gateway: &GatewayClient,
    health: &Arc<HealthState>,
) -> Result<CycleOutcome> {
    let metadata = fetch_metadata(client, &config.cr_namespace, &config.cr_name).await?;
    health.started.store(true, Ordering::Relaxed);

    if metadata.paused {
        return Ok(CycleOutcome::Paused);
    }
    let profile = metadata
        .profiles
        .get(&config.profile)
        .with_context(|| format!("profile '{}' not present in metadata record", config.profile))?
        .clone();
    if profile.paused {
        return Ok(CycleOutcome::Paused);
    }

    let auth = GitAuthFiles {
        token_file: config.git_token_file.clone(),
        ssh_key_file: config.git_ssh_key_file.clone(),
        known_hosts_file: config.git_known_hosts_file.clone(),
    };

    // git2 is blocking; keep it off the runtime threads
    let (commit, synced_ref) = {
        let repo_url = metadata.git_url.clone();
        let repo_path = config.repo_path.clone();
        let target_ref = config
            .ref_override
            .clone()
            .unwrap_or_else(|| metadata.r#ref.clone());
        let target_commit = config
            .ref_override
            .is_none()
            .then(|| metadata.commit.clone());
        let checked_out = tokio::task::spawn_blocking(move || {
            ensure_checkout(
                &repo_url,
                &target_ref,
                target_commit.as_deref(),
                &repo_path,
                &auth,
            )
        })
        .await
        .context("checkout task panicked")??;
        let synced_ref = config
            .ref_override
            .clone()
            .unwrap_or_else(|| metadata.r#ref.clone());
        (checked_out, synced_ref)
    };

    let vars = build_vars(
        &profile.vars,
        &config.gateway_name,
        &config.pod_name,
        &config.pod_namespace,
        &config.cr_name,
        &config.profile,
        &commit,
        &synced_ref,
    );
    let plan = build_plan(&profile, &vars, &config.repo_path, &config.data_path)?;
    let dry_run = plan.dry_run;

    if !dry_run {
        designer_gate(gateway, profile.designer_session_policy).await?;
    }

    let result = tokio::task::spawn_blocking(move || sync::execute(&plan))
        .await
        .context("sync task panicked")??;

    let scan_result = if dry_run {
        "dry-run".to_string()
    } else {
        gateway.scan_projects().await.context("project scan")?;
        gateway.scan_config().await.context("config scan")?;
        "ok".to_string()
    };

    Ok(CycleOutcome::Applied {
        commit,
        synced_ref,
        result,
        scan_result,
        dry_run,
    })
}

/// Enforce the designer session policy before any live-tree write
async fn designer_gate(gateway: &GatewayClient, policy: DesignerSessionPolicy) -> Result<()> {
    match policy {
        DesignerSessionPolicy::Proceed => Ok(()),
        DesignerSessionPolicy::Fail => {
            let sessions = gateway.designer_sessions().await?;
            if sessions.is_empty() {
                Ok(())
            } else {
                bail!(
                    "designer sessions active: {}",
                    describe_sessions(&sessions)
                );
            }
        }
        DesignerSessionPolicy::Wait => {
            let deadline = Instant::now() + DESIGNER_WAIT_TIMEOUT;
            loop {
                let sessions = gateway.designer_sessions().await?;
                if sessions.is_empty() {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    bail!(
                        "designer sessions still active after {}s wait: {}",
                        DESIGNER_WAIT_TIMEOUT.as_secs(),
                        describe_sessions(&sessions)
                    );
                }
                info!(
                    sessions = describe_sessions(&sessions).as_str(),
                    "waiting for designer sessions to close"
                );
                tokio::time::sleep(DESIGNER_WAIT_PROBE).await;
            }
        }
    }
}

/// One-shot: wait for the gateway to come up, then force one extra sync
async fn post_commission_resync(gateway: GatewayClient, tx: mpsc::Sender<Trigger>) {
    loop {
        if gateway.is_responsive().await {
            info!("gateway responsive, requesting post-commission sync");
            let _ = tx.try_send(Trigger::PostCommission);
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

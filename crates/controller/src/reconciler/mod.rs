//! # Reconciler
//!
//! The work unit that drives one `GatewaySync` to its desired state:
//! validate profiles, acquire credentials, resolve the ref, publish the
//! metadata record and derived secrets, discover gateways, maintain agent
//! RBAC, aggregate agent status, compute conditions, and emit events.
//!
//! Errors bubble to the error-policy layer which applies per-resource
//! Fibonacci backoff; configuration errors instead park the resource until
//! the spec changes.

pub mod artifacts;
pub mod auth;
pub mod discovery;
pub mod finalize;
pub mod rbac;
pub mod status;
pub mod types;
pub mod validation;

pub use types::{BackoffState, Reconciler, ReconcilerError, TriggerSource};

use crate::git::resolve_ref;
use crate::observability::metrics;
use anyhow::Context;
use kube::api::{Api, ListParams};
use kube_runtime::controller::Action;
use kube_runtime::events::{Event, EventType};
use kube::Resource;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stoker_api::crd::{condition_types, GitAuthSpec, RefResolutionPhase};
use stoker_api::duration::validate_duration_interval;
use stoker_api::{annotations, Condition, GatewaySync, GatewaySyncStatus, MetadataRecord};
use tracing::{debug, error, info, warn};

/// Fallback requeue when polling is disabled but a transient needs another
/// look
const DEFAULT_REQUEUE: Duration = Duration::from_secs(300);
/// Minimum accepted polling interval
const MIN_POLL_INTERVAL_SECS: u64 = 30;

/// Main reconciliation function; errors are handled by the error-policy
/// layer so a failing resource never blocks the watch path
pub async fn reconcile(
    sync: Arc<GatewaySync>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    let name = sync.metadata.name.as_deref().unwrap_or("unknown").to_string();
    let namespace = sync
        .metadata
        .namespace
        .as_deref()
        .unwrap_or("default")
        .to_string();

    metrics::increment_reconciliations();
    let span = tracing::span!(
        tracing::Level::INFO,
        "reconcile",
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        resource.generation = sync.metadata.generation.unwrap_or(0),
    );
    let _guard = span.enter();

    if sync.metadata.deletion_timestamp.is_some() {
        finalize::cleanup_and_release(&ctx, &sync).await?;
        return Ok(Action::await_change());
    }
    finalize::ensure_finalizer(&ctx.client, &sync).await?;

    let trigger = classify_trigger(&sync);
    info!(trigger = trigger.as_str(), "reconciling GatewaySync");

    if sync.spec.paused {
        return handle_paused(&ctx, &sync).await;
    }

    let previous_conditions = sync
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();

    // Step 1: profile validation. Failures are user errors and wait for a
    // spec change rather than retrying.
    if let Err(validation_error) = validation::validate_profiles(&sync.spec) {
        warn!(error = %validation_error, "profile validation failed");
        let inputs = status::ConditionInputs {
            profiles_valid: Some((
                false,
                validation_error.reason,
                Some(validation_error.to_string()),
            )),
            ..Default::default()
        };
        let conditions = status::compute_conditions(&inputs, &previous_conditions);
        emit_condition_events(&ctx, &sync, &previous_conditions, &conditions).await;
        write_status(&ctx, &sync, conditions, None, RefResolutionPhase::NotResolved).await?;
        metrics::increment_reconciliation_errors();
        return Ok(Action::await_change());
    }

    // Step 2: credentials
    let acquired = match auth::acquire(&ctx, &sync).await {
        Ok(acquired) => acquired,
        Err(e) => {
            return handle_auth_failure(&ctx, &sync, &previous_conditions, e).await;
        }
    };

    // Step 3: ref resolution, honoring the requested-ref annotation
    let requested_ref =
        annotations::get(sync.metadata.annotations.as_ref(), annotations::REQUESTED_REF);
    let declared_ref = requested_ref.unwrap_or(&sync.spec.git.r#ref).to_string();
    let resolution = match resolve_ref(
        &sync.spec.git.repo,
        &declared_ref,
        acquired.material.clone(),
    )
    .await
    {
        Ok(resolution) => resolution,
        Err(resolve_error) => {
            warn!(error = %resolve_error, reference = declared_ref.as_str(), "ref resolution failed");
            let inputs = status::ConditionInputs {
                profiles_valid: Some((true, "Validated", None)),
                ref_resolved: Some((
                    false,
                    resolve_error.condition_reason(),
                    Some(resolve_error.to_string()),
                )),
                ssh_without_known_hosts: acquired.ssh_without_known_hosts,
                ..Default::default()
            };
            let conditions = status::compute_conditions(&inputs, &previous_conditions);
            emit_condition_events(&ctx, &sync, &previous_conditions, &conditions).await;
            write_status(&ctx, &sync, conditions, None, RefResolutionPhase::Error).await?;
            metrics::increment_reconciliation_errors();
            return Err(ReconcilerError::ReconciliationFailed(anyhow::anyhow!(
                "resolving '{declared_ref}': {resolve_error}"
            )));
        }
    };

    let previous_commit = sync
        .status
        .as_ref()
        .and_then(|status| status.last_sync_commit.clone());
    let commit_changed = previous_commit.as_deref() != Some(resolution.commit.as_str());

    // Step 4: derived artifacts
    let trigger_label = annotations::get(
        sync.metadata.annotations.as_ref(),
        annotations::REQUESTED_BY,
    )
    .filter(|_| requested_ref.is_some())
    .unwrap_or("spec")
    .to_string();
    let record = MetadataRecord {
        git_url: sync.spec.git.repo.clone(),
        commit: resolution.commit.clone(),
        r#ref: declared_ref.clone(),
        trigger: trigger_label,
        paused: false,
        exclude_patterns: sync.spec.sync.defaults.exclude_patterns.clone(),
        profiles: stoker_api::resolve_profiles(&sync.spec),
    };
    artifacts::apply_metadata_record(&ctx.client, &sync, &record).await?;
    artifacts::ensure_status_record(&ctx.client, &sync).await?;
    if let Some(token) = &acquired.installation_token {
        artifacts::apply_token_secret(&ctx.client, &sync, token).await?;
    }

    // Step 5: discovery
    let resource_api: Api<GatewaySync> = Api::namespaced(ctx.client.clone(), &namespace);
    let sole_resource = resource_api
        .list(&ListParams::default())
        .await
        .context("listing GatewaySync resources")?
        .items
        .len()
        == 1;
    let discovered =
        discovery::discover_gateways(&ctx.client, &namespace, &name, sole_resource).await?;
    metrics::set_discovered_gateways(discovered.len() as i64);

    // Step 6: agent RBAC
    let service_accounts: BTreeSet<String> = discovered
        .iter()
        .filter_map(|pod| pod.service_account.clone())
        .collect();
    rbac::ensure_agent_rbac(&ctx.client, &namespace, &name, &service_accounts).await?;

    // Step 7: status aggregation
    let records = status::read_status_records(&ctx.client, &namespace, &name).await?;
    status::prune_stale_records(&ctx.client, &namespace, &name, &discovered, &records).await?;
    let gateways = status::aggregate_gateways(&discovered, &records);

    // Step 8: conditions
    let overridden: Vec<String> = discovered
        .iter()
        .filter(|pod| pod.ref_override.is_some())
        .map(|pod| pod.gateway_name.clone())
        .collect();
    let inputs = status::ConditionInputs {
        ref_resolved: Some((true, "Resolved", None)),
        profiles_valid: Some((true, "Validated", None)),
        gateways: &gateways,
        current_commit: Some(&resolution.commit),
        overridden_gateways: &overridden,
        ssh_without_known_hosts: acquired.ssh_without_known_hosts,
        github_exchange_error: None,
    };
    let conditions = status::compute_conditions(&inputs, &previous_conditions);

    // Step 9: events on transitions
    emit_condition_events(&ctx, &sync, &previous_conditions, &conditions).await;
    emit_gateway_events(&ctx, &sync, &gateways).await;

    // Status write
    let last_sync_time = if commit_changed {
        Some(chrono::Utc::now().to_rfc3339())
    } else {
        sync.status
            .as_ref()
            .and_then(|status| status.last_sync_time.clone())
    };
    let new_status = GatewaySyncStatus {
        observed_generation: sync.metadata.generation,
        ref_resolution: Some(RefResolutionPhase::Resolved),
        last_sync_commit: Some(resolution.commit.clone()),
        last_sync_commit_short: Some(resolution.commit.chars().take(7).collect()),
        last_sync_ref: Some(declared_ref.clone()),
        last_sync_time,
        profile_count: i32::try_from(sync.spec.sync.profiles.len()).ok(),
        gateway_count: i32::try_from(gateways.len()).ok(),
        discovered_gateways: gateways,
        conditions,
    };
    status::patch_status(&ctx.client, &sync, &new_status).await?;

    // Success: reset this resource's backoff
    let key = Reconciler::resource_key(&namespace, &name);
    if let Ok(mut states) = ctx.backoff_states.lock() {
        if let Some(state) = states.get_mut(&key) {
            state.reset();
        }
    }

    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
    info!(
        commit = resolution.commit.as_str(),
        gateways = new_status.gateway_count.unwrap_or(0),
        duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()).as_str(),
        "reconciliation complete"
    );

    // Step 10: requeue
    Ok(requeue_action(&sync))
}

/// Which input woke this work unit (best-effort, for logs and metrics)
fn classify_trigger(sync: &GatewaySync) -> TriggerSource {
    let generation = sync.metadata.generation.unwrap_or(0);
    let observed = sync
        .status
        .as_ref()
        .and_then(|status| status.observed_generation)
        .unwrap_or(0);
    let requested = annotations::get(sync.metadata.annotations.as_ref(), annotations::REQUESTED_REF);
    let last_ref = sync
        .status
        .as_ref()
        .and_then(|status| status.last_sync_ref.as_deref());

    if requested.is_some() && requested != last_ref {
        TriggerSource::PushEvent
    } else if generation != observed {
        TriggerSource::SpecChange
    } else {
        TriggerSource::TimerBased
    }
}

async fn handle_paused(
    ctx: &Reconciler,
    sync: &GatewaySync,
) -> Result<Action, ReconcilerError> {
    info!("resource paused; skipping resolution and token refresh");
    // Flip the published record so agents halt too; no new resolution, no
    // token refresh while paused
    let api: Api<k8s_openapi::api::core::v1::ConfigMap> = Api::namespaced(
        ctx.client.clone(),
        sync.metadata.namespace.as_deref().unwrap_or("default"),
    );
    let record_name =
        stoker_api::records::metadata_record_name(sync.metadata.name.as_deref().unwrap_or_default());
    if api.get_opt(&record_name).await.ok().flatten().is_some() {
        let patch = serde_json::json!({
            "data": { stoker_api::records::metadata_keys::PAUSED: "true" }
        });
        let _ = api
            .patch(
                &record_name,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Merge(&patch),
            )
            .await;
    }
    let observed = GatewaySyncStatus {
        observed_generation: sync.metadata.generation,
        ..sync.status.clone().unwrap_or_default()
    };
    status::patch_status(&ctx.client, sync, &observed).await?;
    Ok(Action::await_change())
}

async fn handle_auth_failure(
    ctx: &Reconciler,
    sync: &GatewaySync,
    previous_conditions: &[Condition],
    error: anyhow::Error,
) -> Result<Action, ReconcilerError> {
    let message = format!("{error:#}");
    let is_github_app = matches!(&sync.spec.git.auth, Some(GitAuthSpec::GithubApp { .. }));
    let missing_secret = message.contains("not found") || message.contains("has no key");
    warn!(error = message.as_str(), "credential acquisition failed");

    let reason = if missing_secret { "MissingSecret" } else { "AuthFailed" };
    let inputs = status::ConditionInputs {
        profiles_valid: Some((true, "Validated", None)),
        ref_resolved: Some((false, reason, Some(message.clone()))),
        github_exchange_error: is_github_app.then(|| message.clone()),
        ..Default::default()
    };
    let conditions = status::compute_conditions(&inputs, previous_conditions);
    emit_condition_events(ctx, sync, previous_conditions, &conditions).await;
    write_status(ctx, sync, conditions, None, RefResolutionPhase::Error).await?;
    metrics::increment_reconciliation_errors();

    if missing_secret {
        // Configuration error: wait for the user instead of hammering
        Ok(Action::await_change())
    } else {
        Err(ReconcilerError::ReconciliationFailed(error))
    }
}

/// Write a failure-path status that preserves prior resolution fields
async fn write_status(
    ctx: &Reconciler,
    sync: &GatewaySync,
    conditions: Vec<Condition>,
    gateways: Option<Vec<stoker_api::DiscoveredGateway>>,
    phase: RefResolutionPhase,
) -> Result<(), ReconcilerError> {
    let previous = sync.status.clone().unwrap_or_default();
    let new_status = GatewaySyncStatus {
        observed_generation: sync.metadata.generation,
        ref_resolution: Some(phase),
        profile_count: i32::try_from(sync.spec.sync.profiles.len()).ok(),
        discovered_gateways: gateways.unwrap_or(previous.discovered_gateways.clone()),
        conditions,
        ..previous
    };
    status::patch_status(&ctx.client, sync, &new_status).await?;
    Ok(())
}

fn requeue_action(sync: &GatewaySync) -> Action {
    if !sync.spec.polling.enabled {
        metrics::increment_requeues_total("await-change");
        return Action::await_change();
    }
    match validate_duration_interval(
        &sync.spec.polling.interval,
        "polling.interval",
        MIN_POLL_INTERVAL_SECS,
    ) {
        Ok(interval) => {
            metrics::increment_requeues_total("timer-based");
            debug!(interval_secs = interval.as_secs(), "requeueing on polling interval");
            Action::requeue(interval)
        }
        Err(e) => {
            warn!(error = %e, "invalid polling interval, using default requeue");
            metrics::increment_requeues_total("invalid-interval");
            Action::requeue(DEFAULT_REQUEUE)
        }
    }
}

/// Emit events for condition transitions the user cares about
async fn emit_condition_events(
    ctx: &Reconciler,
    sync: &GatewaySync,
    previous: &[Condition],
    current: &[Condition],
) {
    let transitions = [
        (
            condition_types::REF_RESOLVED,
            "RefResolved",
            "RefResolveFailed",
        ),
        (
            condition_types::ALL_GATEWAYS_SYNCED,
            "SyncCompleted",
            "SyncPending",
        ),
        (
            condition_types::PROFILES_VALID,
            "ProfilesValidated",
            "ProfilesInvalid",
        ),
    ];
    for (condition_type, true_reason, false_reason) in transitions {
        let old = status::find_condition(previous, condition_type).map(|c| c.status.as_str());
        let Some(new) = status::find_condition(current, condition_type) else {
            continue;
        };
        if old == Some(new.status.as_str()) {
            continue;
        }
        let became_true = new.status == "True";
        let (event_type, reason) = if became_true {
            (EventType::Normal, true_reason)
        } else {
            (EventType::Warning, false_reason)
        };
        emit(ctx, sync, event_type, reason, new.message.clone()).await;
    }
}

/// Events for per-gateway noteworthy states (designer blocks, discovery)
async fn emit_gateway_events(
    ctx: &Reconciler,
    sync: &GatewaySync,
    gateways: &[stoker_api::DiscoveredGateway],
) {
    let previous_count = sync
        .status
        .as_ref()
        .and_then(|status| status.gateway_count)
        .unwrap_or(0);
    let count = i32::try_from(gateways.len()).unwrap_or(0);
    if previous_count != count {
        emit(
            ctx,
            sync,
            EventType::Normal,
            "GatewaysChanged",
            Some(format!("discovered gateways: {previous_count} -> {count}")),
        )
        .await;
    }

    for gateway in gateways {
        let blocked = gateway
            .message
            .as_deref()
            .is_some_and(|message| message.contains("designer sessions"));
        if !blocked {
            continue;
        }
        let previously_blocked = sync
            .status
            .as_ref()
            .map(|status| &status.discovered_gateways)
            .into_iter()
            .flatten()
            .any(|old| {
                old.name == gateway.name
                    && old
                        .message
                        .as_deref()
                        .is_some_and(|message| message.contains("designer sessions"))
            });
        if !previously_blocked {
            emit(
                ctx,
                sync,
                EventType::Warning,
                "DesignerSessionsBlocked",
                gateway.message.clone(),
            )
            .await;
        }
    }
}

async fn emit(
    ctx: &Reconciler,
    sync: &GatewaySync,
    event_type: EventType,
    reason: &str,
    note: Option<String>,
) {
    let event = Event {
        type_: event_type,
        reason: reason.to_string(),
        note,
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = ctx.recorder.publish(&event, &sync.object_ref(&())).await {
        error!(error = %e, reason, "event publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_sync() -> GatewaySync {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "stoker.dev/v1beta1",
            "kind": "GatewaySync",
            "metadata": {"name": "plant", "namespace": "ignition", "generation": 3},
            "spec": {
                "git": {"repo": "https://example.com/config.git", "ref": "main"},
                "gateway": {"api": {"secretName": "api-key"}},
                "sync": {"profiles": {"default": {"mappings": [
                    {"source": "projects", "destination": "projects"}
                ]}}},
            },
        }))
        .expect("sync parses")
    }

    #[test]
    fn trigger_classification_prefers_push_events() {
        let mut sync = base_sync();
        sync.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(annotations::REQUESTED_REF.to_string(), "v2.0.0".to_string());
        assert_eq!(classify_trigger(&sync), TriggerSource::PushEvent);

        // Once the ref landed in status, the same annotation is not a new push
        sync.status = Some(GatewaySyncStatus {
            last_sync_ref: Some("v2.0.0".to_string()),
            observed_generation: Some(3),
            ..Default::default()
        });
        assert_eq!(classify_trigger(&sync), TriggerSource::TimerBased);
    }

    #[test]
    fn trigger_classification_sees_spec_changes() {
        let mut sync = base_sync();
        sync.status = Some(GatewaySyncStatus {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert_eq!(classify_trigger(&sync), TriggerSource::SpecChange);

        sync.status = Some(GatewaySyncStatus {
            observed_generation: Some(3),
            ..Default::default()
        });
        assert_eq!(classify_trigger(&sync), TriggerSource::TimerBased);
    }

    #[test]
    fn requeue_follows_the_polling_interval() {
        let sync = base_sync();
        assert_eq!(
            requeue_action(&sync),
            Action::requeue(Duration::from_secs(300))
        );

        let mut disabled = base_sync();
        disabled.spec.polling.enabled = false;
        assert_eq!(requeue_action(&disabled), Action::await_change());

        let mut custom = base_sync();
        custom.spec.polling.interval = "2m".to_string();
        assert_eq!(
            requeue_action(&custom),
            Action::requeue(Duration::from_secs(120))
        );
    }
}

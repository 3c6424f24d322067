//! # Watch Loop
//!
//! Wires the kube-runtime controller: the primary GatewaySync watch plus
//! the owned derived records (status ConfigMaps trigger aggregation) and a
//! pod watch mapped through the cr-name annotation.
//!
//! The resource watch uses `any_semantic` so annotation-only changes (the
//! receiver's requested-ref write does not bump the generation) still wake
//! the reconciler.

use crate::reconciler::{reconcile, Reconciler};
use crate::runtime::error_policy::handle_reconciliation_error;
use crate::server::ServerState;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use stoker_api::{annotations, GatewaySync};
use tracing::{debug, error, info, warn};

/// Map a pod event to its owning resource via the cr-name annotation.
///
/// Pods without the annotation (legal in single-resource namespaces) are
/// picked up by the polling timer instead; the mapper cannot list resources
/// synchronously.
fn map_pod(pod: &Pod) -> Option<ObjectRef<GatewaySync>> {
    let annotations_map = pod.metadata.annotations.as_ref();
    if !annotations::inject_requested(annotations_map) {
        return None;
    }
    let cr_name = annotations::get(annotations_map, annotations::CR_NAME)?;
    let namespace = pod.metadata.namespace.as_deref()?;
    Some(ObjectRef::new(cr_name).within(namespace))
}

/// Run the controller until shutdown
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) -> Result<(), anyhow::Error> {
    let resources: Api<GatewaySync> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    // Derived records carry the owned-by label; the owns relation itself is
    // established by the owner references the reconciler stamps
    let records: Api<ConfigMap> = Api::all(client.clone());
    let record_watch = watcher::Config::default().labels(annotations::OWNED_BY_LABEL);

    info!("Starting controller watch loop...");

    let shutdown_state = server_state.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal, marking server not ready");
        shutdown_state
            .is_ready
            .store(false, std::sync::atomic::Ordering::Relaxed);
    });

    loop {
        if !server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        Controller::new(resources.clone(), watcher::Config::default().any_semantic())
            .owns(records.clone(), record_watch.clone())
            .watches(pods.clone(), watcher::Config::default(), |pod| {
                map_pod(&pod)
            })
            .shutdown_on_signal()
            .run(reconcile, handle_reconciliation_error, reconciler.clone())
            .for_each(|result| async {
                match result {
                    Ok((object, action)) => {
                        debug!(resource = %object, action = ?action, "reconciled");
                    }
                    Err(e) => {
                        error!(error = %e, "controller stream error");
                    }
                }
            })
            .await;

        if !server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("Shutdown requested, exiting watch loop");
            break;
        }
        warn!("Controller watch stream ended, restarting in 5 seconds...");
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}

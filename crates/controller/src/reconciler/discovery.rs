//! # Gateway Discovery
//!
//! Work-unit step 5: enumerate pods in the resource namespace that opted
//! in by annotation and belong to this resource, compute their gateway
//! names, and flag pods missing the agent container.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use stoker_api::annotations;
use tracing::debug;

/// One discovered gateway pod
#[derive(Debug, Clone)]
pub struct DiscoveredPod {
    pub gateway_name: String,
    pub pod_name: String,
    pub namespace: String,
    pub service_account: Option<String>,
    pub profile: Option<String>,
    pub has_agent: bool,
    /// ref-override annotation, when present
    pub ref_override: Option<String>,
}

/// Gateway name precedence: annotation, app.kubernetes.io/name label, pod
/// name
#[must_use]
pub fn gateway_name_for(pod: &Pod) -> String {
    if let Some(name) = annotations::get(pod.metadata.annotations.as_ref(), annotations::GATEWAY_NAME)
    {
        return name.to_string();
    }
    if let Some(name) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("app.kubernetes.io/name"))
    {
        return name.clone();
    }
    pod.metadata.name.clone().unwrap_or_default()
}

/// Whether the pod belongs to the named resource
#[must_use]
pub fn pod_matches_resource(pod: &Pod, cr_name: &str, sole_resource_in_namespace: bool) -> bool {
    if !annotations::inject_requested(pod.metadata.annotations.as_ref()) {
        return false;
    }
    match annotations::get(pod.metadata.annotations.as_ref(), annotations::CR_NAME) {
        Some(annotated) => annotated == cr_name,
        // Unannotated pods only bind when the resource is unambiguous
        None => sole_resource_in_namespace,
    }
}

fn has_agent_container(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.init_containers.as_ref())
        .is_some_and(|containers| {
            containers
                .iter()
                .any(|container| container.name == annotations::AGENT_CONTAINER_NAME)
        })
}

/// Discover gateway pods for one resource
pub async fn discover_gateways(
    client: &Client,
    namespace: &str,
    cr_name: &str,
    sole_resource_in_namespace: bool,
) -> Result<Vec<DiscoveredPod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pods = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("listing pods in {namespace}"))?;

    let mut discovered = Vec::new();
    for pod in pods.items {
        if !pod_matches_resource(&pod, cr_name, sole_resource_in_namespace) {
            continue;
        }
        // Terminating pods drop out of discovery right away
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let annotations_map = pod.metadata.annotations.as_ref();
        discovered.push(DiscoveredPod {
            gateway_name: gateway_name_for(&pod),
            pod_name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: namespace.to_string(),
            service_account: pod
                .spec
                .as_ref()
                .and_then(|spec| spec.service_account_name.clone()),
            profile: annotations::get(annotations_map, annotations::PROFILE).map(str::to_string),
            has_agent: has_agent_container(&pod),
            ref_override: annotations::get(annotations_map, annotations::REF_OVERRIDE)
                .map(str::to_string),
        });
    }
    discovered.sort_by(|a, b| a.gateway_name.cmp(&b.gateway_name));
    debug!(
        namespace,
        cr_name,
        gateways = discovered.len(),
        "gateway discovery complete"
    );
    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(
        name: &str,
        annotations_map: &[(&str, &str)],
        labels: &[(&str, &str)],
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(
                    annotations_map
                        .iter()
                        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                        .collect(),
                ),
                labels: if labels.is_empty() {
                    None
                } else {
                    Some(
                        labels
                            .iter()
                            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                            .collect::<BTreeMap<_, _>>(),
                    )
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn gateway_name_precedence() {
        let annotated = pod(
            "pod-0",
            &[(annotations::GATEWAY_NAME, "edge-a")],
            &[("app.kubernetes.io/name", "label-name")],
        );
        assert_eq!(gateway_name_for(&annotated), "edge-a");

        let labelled = pod("pod-0", &[], &[("app.kubernetes.io/name", "label-name")]);
        assert_eq!(gateway_name_for(&labelled), "label-name");

        let bare = pod("pod-0", &[], &[]);
        assert_eq!(gateway_name_for(&bare), "pod-0");
    }

    #[test]
    fn matching_requires_opt_in_and_resource_identity() {
        let unannotated = pod("pod-0", &[], &[]);
        assert!(!pod_matches_resource(&unannotated, "plant", true));

        let opted = pod("pod-0", &[(annotations::INJECT, "true")], &[]);
        assert!(pod_matches_resource(&opted, "plant", true));
        assert!(
            !pod_matches_resource(&opted, "plant", false),
            "ambiguous namespace needs the cr-name annotation"
        );

        let named = pod(
            "pod-0",
            &[
                (annotations::INJECT, "true"),
                (annotations::CR_NAME, "plant"),
            ],
            &[],
        );
        assert!(pod_matches_resource(&named, "plant", false));
        assert!(!pod_matches_resource(&named, "other", false));
    }
}

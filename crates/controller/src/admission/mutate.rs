//! # Pod Mutation
//!
//! Builds the mutated pod: the `stoker-agent` native sidecar init
//! container, its volumes, probes, environment, and security context. Pure
//! construction so injection is testable without an API server.

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, ObjectFieldSelector, Pod, Probe, ResourceRequirements, SeccompProfile,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use stoker_api::crd::GitAuthSpec;
use stoker_api::records::token_secret_name;
use stoker_api::{annotations, GatewaySync};

/// Secret mode for credential mounts (r-------- )
const SECRET_FILE_MODE: i32 = 0o400;

/// Mount points inside the agent container
const REPO_MOUNT: &str = "/repo";
const GIT_CREDS_MOUNT: &str = "/etc/stoker/git";
const KNOWN_HOSTS_MOUNT: &str = "/etc/stoker/known-hosts";
const API_KEY_MOUNT: &str = "/etc/stoker/gateway-api";

/// Volume names added to the pod
const REPO_VOLUME: &str = "stoker-repo";
const GIT_CREDS_VOLUME: &str = "stoker-git-credentials";
const KNOWN_HOSTS_VOLUME: &str = "stoker-known-hosts";
const API_KEY_VOLUME: &str = "stoker-api-key";

/// Well-known names of the Ignition data volume
const DATA_VOLUME_NAMES: [&str; 2] = ["ignition-data", "data"];

/// Whether the pod already carries the agent init container
#[must_use]
pub fn already_injected(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.init_containers.as_ref())
        .is_some_and(|containers| {
            containers
                .iter()
                .any(|container| container.name == annotations::AGENT_CONTAINER_NAME)
        })
}

/// Agent image priority: pod annotation > resource spec > process default >
/// built-in default
#[must_use]
pub fn resolve_agent_image(
    pod: &Pod,
    sync: &GatewaySync,
    process_default: Option<&str>,
) -> String {
    if let Some(image) = annotations::get(pod.metadata.annotations.as_ref(), annotations::AGENT_IMAGE)
    {
        return image.to_string();
    }
    if let Some(image) = sync
        .spec
        .agent
        .as_ref()
        .and_then(|agent| agent.image.as_deref())
    {
        return image.to_string();
    }
    if let Some(image) = process_default {
        return image.to_string();
    }
    crate::config::BUILTIN_AGENT_IMAGE.to_string()
}

/// Find the Ignition data volume and the path existing containers mount it
/// at
fn discover_data_volume(pod: &Pod) -> Option<(String, String)> {
    let spec = pod.spec.as_ref()?;
    let volumes = spec.volumes.as_ref()?;
    let volume = volumes
        .iter()
        .find(|volume| DATA_VOLUME_NAMES.contains(&volume.name.as_str()))?;
    let mount_path = spec
        .containers
        .iter()
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .find(|mount| mount.name == volume.name)
        .map(|mount| mount.mount_path.clone())
        .unwrap_or_else(|| crate::admission::DEFAULT_DATA_PATH.to_string());
    Some((volume.name.clone(), mount_path))
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            default_mode: Some(SECRET_FILE_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: u16) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(port)),
            ..Default::default()
        }),
        period_seconds: Some(10),
        failure_threshold: Some(6),
        ..Default::default()
    }
}

/// Build the mutated pod. The caller has already established that the pod
/// opted in, is not injected yet, and the resource allows it.
#[must_use]
pub fn mutate_pod(pod: &Pod, sync: &GatewaySync, process_default_image: Option<&str>) -> Pod {
    let mut mutated = pod.clone();
    let cr_name = sync.metadata.name.as_deref().unwrap_or_default();
    let cr_namespace = sync.metadata.namespace.as_deref().unwrap_or_default();
    let pod_annotations = pod.metadata.annotations.as_ref();
    let health_port = stoker_api::AGENT_HEALTH_PORT;

    let profile = annotations::get(pod_annotations, annotations::PROFILE)
        .map(str::to_string)
        .unwrap_or_else(|| default_profile_name(sync));
    let resolved_profile = stoker_api::profile::resolve_profiles(&sync.spec)
        .get(&profile)
        .cloned();
    let sync_period = resolved_profile
        .map(|p| p.sync_period)
        .unwrap_or(sync.spec.sync.defaults.sync_period);

    let gateway_name = annotations::get(pod_annotations, annotations::GATEWAY_NAME)
        .map(str::to_string)
        .or_else(|| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get("app.kubernetes.io/name"))
                .cloned()
        });

    let data_volume = discover_data_volume(pod);
    let data_path = data_volume
        .as_ref()
        .map_or(crate::admission::DEFAULT_DATA_PATH, |(_, path)| path.as_str());

    let mut env = vec![
        downward_env("POD_NAME", "metadata.name"),
        downward_env("POD_NAMESPACE", "metadata.namespace"),
        plain_env("CR_NAME", cr_name),
        plain_env("CR_NAMESPACE", cr_namespace),
        plain_env("REPO_PATH", REPO_MOUNT),
        plain_env("DATA_PATH", data_path),
        plain_env("GATEWAY_PORT", sync.spec.gateway.port.to_string()),
        plain_env("GATEWAY_TLS", sync.spec.gateway.tls.to_string()),
        plain_env(
            "API_KEY_FILE",
            format!("{API_KEY_MOUNT}/{}", sync.spec.gateway.api.secret_key),
        ),
        plain_env("PROFILE", &profile),
        plain_env("SYNC_PERIOD", sync_period.to_string()),
        plain_env("HEALTH_PORT", health_port.to_string()),
    ];
    if let Some(gateway_name) = &gateway_name {
        env.push(plain_env("GATEWAY_NAME", gateway_name));
    }
    if let Some(ref_override) = annotations::get(pod_annotations, annotations::REF_OVERRIDE) {
        env.push(plain_env("REF_OVERRIDE", ref_override));
    }

    let mut volumes = vec![
        Volume {
            name: REPO_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        secret_volume(API_KEY_VOLUME, &sync.spec.gateway.api.secret_name),
    ];
    let mut mounts = vec![
        VolumeMount {
            name: REPO_VOLUME.to_string(),
            mount_path: REPO_MOUNT.to_string(),
            ..Default::default()
        },
        read_only_mount(API_KEY_VOLUME, API_KEY_MOUNT),
    ];
    if let Some((volume_name, mount_path)) = &data_volume {
        mounts.push(VolumeMount {
            name: volume_name.clone(),
            mount_path: mount_path.clone(),
            ..Default::default()
        });
    }

    // Credential volume per auth scheme; only paths enter the environment
    match &sync.spec.git.auth {
        Some(GitAuthSpec::Token { secret_ref }) => {
            volumes.push(secret_volume(GIT_CREDS_VOLUME, &secret_ref.name));
            mounts.push(read_only_mount(GIT_CREDS_VOLUME, GIT_CREDS_MOUNT));
            env.push(plain_env(
                "GIT_TOKEN_FILE",
                format!("{GIT_CREDS_MOUNT}/{}", secret_ref.key_or("token")),
            ));
        }
        Some(GitAuthSpec::Ssh {
            key_ref,
            known_hosts_ref,
        }) => {
            volumes.push(secret_volume(GIT_CREDS_VOLUME, &key_ref.name));
            mounts.push(read_only_mount(GIT_CREDS_VOLUME, GIT_CREDS_MOUNT));
            env.push(plain_env(
                "GIT_SSH_KEY_FILE",
                format!("{GIT_CREDS_MOUNT}/{}", key_ref.key_or("ssh-privatekey")),
            ));
            if let Some(known_hosts) = known_hosts_ref {
                volumes.push(secret_volume(KNOWN_HOSTS_VOLUME, &known_hosts.name));
                mounts.push(read_only_mount(KNOWN_HOSTS_VOLUME, KNOWN_HOSTS_MOUNT));
                env.push(plain_env(
                    "GIT_KNOWN_HOSTS_FILE",
                    format!("{KNOWN_HOSTS_MOUNT}/{}", known_hosts.key_or("known_hosts")),
                ));
            }
        }
        Some(GitAuthSpec::GithubApp { .. }) => {
            // Agents mount the short-lived derived token, never the PEM
            volumes.push(secret_volume(GIT_CREDS_VOLUME, &token_secret_name(cr_name)));
            mounts.push(read_only_mount(GIT_CREDS_VOLUME, GIT_CREDS_MOUNT));
            env.push(plain_env("GIT_TOKEN_FILE", format!("{GIT_CREDS_MOUNT}/token")));
        }
        None => {}
    }

    let resources = sync
        .spec
        .agent
        .as_ref()
        .and_then(|agent| agent.resources.as_ref())
        .map(|resources| ResourceRequirements {
            requests: to_quantities(&resources.requests),
            limits: to_quantities(&resources.limits),
            ..Default::default()
        });

    let agent = Container {
        name: annotations::AGENT_CONTAINER_NAME.to_string(),
        image: Some(resolve_agent_image(pod, sync, process_default_image)),
        // Native sidecar: starts before and terminates with the workload
        restart_policy: Some("Always".to_string()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some("health".to_string()),
            container_port: i32::from(health_port),
            ..Default::default()
        }]),
        volume_mounts: Some(mounts),
        startup_probe: Some(http_probe("/healthz/startup", health_port)),
        liveness_probe: Some(http_probe("/healthz/live", health_port)),
        readiness_probe: Some(http_probe("/healthz/ready", health_port)),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources,
        ..Default::default()
    };

    let spec = mutated.spec.get_or_insert_with(Default::default);
    let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
    init_containers.insert(0, agent);
    let pod_volumes = spec.volumes.get_or_insert_with(Vec::new);
    for volume in volumes {
        if !pod_volumes.iter().any(|existing| existing.name == volume.name) {
            pod_volumes.push(volume);
        }
    }

    mutated
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(annotations::INJECTED.to_string(), "true".to_string());

    mutated
}

/// Profile used when the pod does not name one: the only profile if there
/// is exactly one, else "default"
#[must_use]
pub fn default_profile_name(sync: &GatewaySync) -> String {
    let profiles = &sync.spec.sync.profiles;
    if profiles.len() == 1 {
        profiles
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    } else {
        "default".to_string()
    }
}

fn to_quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(key, value)| (key.clone(), Quantity(value.clone())))
            .collect(),
    )
}

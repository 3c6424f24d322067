//! # Agent RBAC
//!
//! Work-unit step 6: keep a namespaced Role/RoleBinding pair that lets the
//! service accounts of discovered gateway pods read the metadata record and
//! write their key of the status record. Scoped by resourceNames so agents
//! cannot touch records of other resources.

use anyhow::{Context, Result};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeSet;
use stoker_api::records::{agent_rbac_name, metadata_record_name, status_record_name};
use tracing::{debug, info};

fn role_for(namespace: &str, cr_name: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(agent_rbac_name(cr_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(
                    stoker_api::annotations::OWNED_BY_LABEL.to_string(),
                    cr_name.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["configmaps".to_string()]),
                resource_names: Some(vec![
                    metadata_record_name(cr_name),
                    status_record_name(cr_name),
                ]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["configmaps".to_string()]),
                resource_names: Some(vec![status_record_name(cr_name)]),
                verbs: vec!["update".to_string(), "patch".to_string()],
                ..Default::default()
            },
        ]),
    }
}

fn binding_for(namespace: &str, cr_name: &str, service_accounts: &BTreeSet<String>) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(agent_rbac_name(cr_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(
                    stoker_api::annotations::OWNED_BY_LABEL.to_string(),
                    cr_name.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: agent_rbac_name(cr_name),
        },
        subjects: Some(
            service_accounts
                .iter()
                .map(|account| Subject {
                    kind: "ServiceAccount".to_string(),
                    name: account.clone(),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

/// Reconcile the Role and RoleBinding to the discovered service accounts,
/// handling additions and removals
pub async fn ensure_agent_rbac(
    client: &Client,
    namespace: &str,
    cr_name: &str,
    service_accounts: &BTreeSet<String>,
) -> Result<()> {
    let roles: Api<Role> = Api::namespaced(client.clone(), namespace);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let name = agent_rbac_name(cr_name);

    let desired_role = role_for(namespace, cr_name);
    match roles.get_opt(&name).await? {
        None => {
            roles
                .create(&PostParams::default(), &desired_role)
                .await
                .with_context(|| format!("creating role {name}"))?;
            info!(role = name.as_str(), "agent role created");
        }
        Some(existing) if existing.rules != desired_role.rules => {
            roles
                .patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&serde_json::json!({ "rules": desired_role.rules })),
                )
                .await
                .with_context(|| format!("patching role {name}"))?;
        }
        Some(_) => {}
    }

    let desired_binding = binding_for(namespace, cr_name, service_accounts);
    match bindings.get_opt(&name).await? {
        None => {
            bindings
                .create(&PostParams::default(), &desired_binding)
                .await
                .with_context(|| format!("creating role binding {name}"))?;
            info!(
                binding = name.as_str(),
                subjects = service_accounts.len(),
                "agent role binding created"
            );
        }
        Some(existing) if existing.subjects != desired_binding.subjects => {
            bindings
                .patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&serde_json::json!({ "subjects": desired_binding.subjects })),
                )
                .await
                .with_context(|| format!("patching role binding {name}"))?;
            info!(
                binding = name.as_str(),
                subjects = service_accounts.len(),
                "agent role binding subjects reconciled"
            );
        }
        Some(_) => {
            debug!(binding = name.as_str(), "agent rbac unchanged");
        }
    }
    Ok(())
}

/// Delete the Role and RoleBinding (finalizer path)
pub async fn remove_agent_rbac(client: &Client, namespace: &str, cr_name: &str) -> Result<()> {
    let roles: Api<Role> = Api::namespaced(client.clone(), namespace);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    let name = agent_rbac_name(cr_name);
    let _ = bindings.delete(&name, &Default::default()).await;
    let _ = roles.delete(&name, &Default::default()).await;
    Ok(())
}

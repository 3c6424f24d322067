//! # Credential Acquisition
//!
//! Work-unit step 2: turn the spec's auth reference into resolver-ready
//! material. Token and SSH secrets live in the resource namespace; GitHub
//! App PEMs are read only from the controller's own namespace and never
//! leave this process.

use crate::git::GitAuthMaterial;
use crate::github::{AppConfig, InstallationToken};
use crate::reconciler::types::Reconciler;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use stoker_api::crd::{GatewaySync, GitAuthSpec, SecretKeyRef};
use tracing::debug;

/// What step 2 produced
#[derive(Debug, Default)]
pub struct AcquiredAuth {
    pub material: GitAuthMaterial,
    /// Present only for GitHub App auth; persisted into the derived secret
    pub installation_token: Option<InstallationToken>,
    /// SSH auth configured without known_hosts
    pub ssh_without_known_hosts: bool,
}

/// Read one key out of a secret
async fn read_secret_key(
    client: &Client,
    namespace: &str,
    secret_ref: &SecretKeyRef,
    default_key: &str,
) -> Result<Vec<u8>> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api
        .get_opt(&secret_ref.name)
        .await
        .with_context(|| format!("reading secret {namespace}/{}", secret_ref.name))?
        .with_context(|| format!("secret {namespace}/{} not found", secret_ref.name))?;
    let key = secret_ref.key_or(default_key);
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .with_context(|| format!("secret {namespace}/{} has no key '{key}'", secret_ref.name))?;
    Ok(data.0.clone())
}

/// Acquire credentials for one resource
pub async fn acquire(ctx: &Reconciler, sync: &GatewaySync) -> Result<AcquiredAuth> {
    let namespace = sync.metadata.namespace.as_deref().unwrap_or("default");
    let name = sync.metadata.name.as_deref().unwrap_or_default();

    match &sync.spec.git.auth {
        None => Ok(AcquiredAuth::default()),
        Some(GitAuthSpec::Token { secret_ref }) => {
            let token = read_secret_key(&ctx.client, namespace, secret_ref, "token").await?;
            Ok(AcquiredAuth {
                material: GitAuthMaterial::Token {
                    token: String::from_utf8_lossy(&token).trim().to_string(),
                },
                ..Default::default()
            })
        }
        Some(GitAuthSpec::Ssh {
            key_ref,
            known_hosts_ref,
        }) => {
            let private_key =
                read_secret_key(&ctx.client, namespace, key_ref, "ssh-privatekey").await?;
            let known_hosts = match known_hosts_ref {
                Some(known_hosts_ref) => Some(String::from_utf8_lossy(
                    &read_secret_key(&ctx.client, namespace, known_hosts_ref, "known_hosts")
                        .await?,
                )
                .into_owned()),
                None => None,
            };
            let ssh_without_known_hosts = known_hosts.is_none();
            Ok(AcquiredAuth {
                material: GitAuthMaterial::Ssh {
                    private_key: String::from_utf8_lossy(&private_key).into_owned(),
                    known_hosts,
                },
                installation_token: None,
                ssh_without_known_hosts,
            })
        }
        Some(GitAuthSpec::GithubApp {
            app_id,
            installation_id,
            pem_ref,
            api_base_url,
        }) => {
            // Confinement: the PEM is read from the controller namespace,
            // never from the resource namespace
            let pem = read_secret_key(
                &ctx.client,
                &ctx.controller_namespace,
                pem_ref,
                "privateKey.pem",
            )
            .await?;
            let key = Reconciler::resource_key(namespace, name);
            let config = AppConfig {
                app_id: *app_id,
                installation_id: *installation_id,
                api_base_url: api_base_url.clone(),
            };
            let token = ctx
                .token_broker
                .token_for(&key, &config, &pem)
                .await
                .map_err(|e| anyhow::anyhow!("{}: {e}", e.condition_reason()))?;
            debug!(key = key.as_str(), "github app token acquired");
            Ok(AcquiredAuth {
                material: GitAuthMaterial::Token {
                    token: token.token.clone(),
                },
                installation_token: Some(token),
                ssh_without_known_hosts: false,
            })
        }
    }
}

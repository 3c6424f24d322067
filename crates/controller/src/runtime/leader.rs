//! # Leader Election
//!
//! Lease-based leader election over `coordination.k8s.io/v1`. Exactly one
//! replica runs the reconciler and receiver; standbys stay warm and take
//! over when the lease expires. The admission mutator is deliberately not
//! gated: it is stateless and serves from every replica.

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the controller's lease object
pub const LEASE_NAME: &str = "stoker-controller-lock";
/// Leadership is considered lost this long after the last renewal
const LEASE_TTL: Duration = Duration::from_secs(15);
/// Renewal cadence while leading
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
/// Retry cadence while standing by
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// One contender for the controller lease
#[derive(Debug, Clone)]
pub struct LeaderElector {
    api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    #[must_use]
    pub fn new(client: Client, namespace: &str, identity: String) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Block until this replica holds the lease
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = self.identity.as_str(), "waiting for leadership");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = self.identity.as_str(), "leadership acquired");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("lease held elsewhere, standing by");
                }
                Err(e) => {
                    warn!(error = %e, "lease acquisition attempt failed");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renew forever; exits the process if leadership is lost so a warm
    /// standby takes over cleanly
    pub async fn renew_loop(self) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("leadership lost to another replica, exiting for clean takeover");
                    std::process::exit(0);
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed, retrying");
                }
            }
        }
    }

    /// One acquisition/renewal attempt; true when we hold the lease after
    /// the call
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let ttl_seconds = i32::try_from(LEASE_TTL.as_secs()).unwrap_or(15);

        match self.api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_duration_seconds: Some(ttl_seconds),
                        ..Default::default()
                    }),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Lost the creation race
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                    Err(e) => Err(e).context("creating controller lease"),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(Default::default);
                let held_by_us = spec.holder_identity.as_deref() == Some(&self.identity);
                let expired = spec
                    .renew_time
                    .as_ref()
                    .map(|renewed| {
                        let age = Utc::now().signed_duration_since(renewed.0);
                        age.num_seconds() > i64::from(spec.lease_duration_seconds.unwrap_or(ttl_seconds))
                    })
                    .unwrap_or(true);

                if !held_by_us && !expired {
                    return Ok(false);
                }

                if !held_by_us {
                    info!(
                        previous = spec.holder_identity.as_deref().unwrap_or("unknown"),
                        "taking over an expired lease"
                    );
                    spec.holder_identity = Some(self.identity.clone());
                    spec.acquire_time = Some(now.clone());
                    spec.lease_duration_seconds = Some(ttl_seconds);
                }
                spec.renew_time = Some(now);

                match self
                    .api
                    .replace(LEASE_NAME, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    // Someone else renewed between our read and write
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                    Err(e) => Err(e).context("renewing controller lease"),
                }
            }
        }
    }
}

//! # Reconciler Types
//!
//! Context struct, error type, trigger classification, and per-resource
//! backoff state.

use crate::backoff::FibonacciBackoff;
use crate::github::TokenBroker;
use anyhow::Result;
use kube::Client;
use kube_runtime::events::{Recorder, Reporter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(#[from] anyhow::Error),
}

/// Why a work unit ran; used for logging and requeue metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Spec change (generation moved)
    SpecChange,
    /// requested-ref annotation written by the push receiver
    PushEvent,
    /// Polling timer or status-record change
    TimerBased,
    /// Retry after an error backoff
    ErrorBackoff,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::SpecChange => "spec-change",
            TriggerSource::PushEvent => "push-event",
            TriggerSource::TimerBased => "timer-based",
            TriggerSource::ErrorBackoff => "error-backoff",
        }
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // 15 seconds minimum, 10 minutes maximum
            backoff: FibonacciBackoff::new(15, 600),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared reconciler context
#[derive(Clone)]
pub struct Reconciler {
    pub client: Client,
    /// Per-resource GitHub App token cache (single-flight inside)
    pub token_broker: Arc<TokenBroker>,
    /// Event recorder (reporter: stoker-controller)
    pub recorder: Recorder,
    /// Namespace this controller runs in; GitHub App PEMs are only ever
    /// read from here
    pub controller_namespace: String,
    /// Backoff state per resource, consumed by the error-policy layer
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("controller_namespace", &self.controller_namespace)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(client: Client, controller_namespace: String) -> Result<Self> {
        let reporter = Reporter {
            controller: "stoker-controller".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Ok(Self {
            client,
            token_broker: Arc::new(TokenBroker::new()),
            recorder,
            controller_namespace,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// `namespace/name` key used for backoff and token-broker entries
    #[must_use]
    pub fn resource_key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }
}

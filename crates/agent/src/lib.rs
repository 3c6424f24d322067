//! # Stoker Agent
//!
//! Runs alongside an Ignition gateway as a native sidecar. Each cycle it
//! reads the metadata record published by the controller, checks out the
//! target commit, renders the selected profile into a staging tree, merges
//! it into the gateway data directory, asks the gateway to rescan, and
//! publishes a per-gateway status record.
//!
//! The filesystem transform itself lives in [`sync`] and is Kubernetes- and
//! gateway-unaware; everything around it is plumbing.

pub mod config;
pub mod gateway;
pub mod git;
pub mod health;
pub mod metadata;
pub mod plan;
pub mod run;
pub mod status;
pub mod sync;

/// Agent build version, reported in the status record
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

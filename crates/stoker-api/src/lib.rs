//! # Stoker API
//!
//! Shared types for the Stoker controller and sync agent:
//!
//! - The `GatewaySync` custom resource (spec, status, conditions)
//! - The stable annotation vocabulary (`stoker.dev/...`)
//! - Derived record names and payloads (metadata record, status record,
//!   derived token secret)
//! - Profile resolution (per-field inheritance from `sync.defaults`)
//! - The templating contract used for mapping paths and templated files
//!
//! The controller publishes the metadata record and reads the status record;
//! the agent does the reverse. Both sides deserialize through the types in
//! this crate so the wire shapes stay in one place.

pub mod annotations;
pub mod crd;
pub mod duration;
pub mod profile;
pub mod records;
pub mod template;

pub use crd::{
    ApiKeyRef, Condition, DesignerSessionPolicy, DiscoveredGateway, GatewaySync, GatewaySyncSpec,
    GatewaySyncStatus, GitAuthSpec, GitSpec, MappingSpec, MappingType, PatchSpec, ProfileSpec,
    RefResolutionPhase, SecretKeyRef, SyncDefaults, SyncPhase, SyncSpec,
};
pub use profile::{resolve_profiles, ResolvedProfile, ResolvedProfileSet};
pub use records::{GatewayStatusRecord, MetadataRecord};

/// Port the agent's health server listens on; the mutator wires the probes
/// here
pub const AGENT_HEALTH_PORT: u16 = 8570;

//! # GatewaySync CRD
//!
//! Custom resource definition for Git-driven Ignition gateway sync.

mod spec;
mod status;

pub use spec::{
    default_gateway_port, default_git_ref, default_polling_interval, default_sync_period,
    AgentOverrides, AgentResources, ApiKeyRef, DesignerSessionPolicy, GatewayConnection,
    GatewaySync, GatewaySyncSpec, GitAuthSpec, GitSpec, MappingSpec, MappingType, PatchSpec,
    PollingSpec, ProfileSpec, SecretKeyRef, SyncDefaults, SyncSpec, MAX_SYNC_PERIOD_SECS,
    MIN_SYNC_PERIOD_SECS,
};
pub use status::{
    condition_types, Condition, DiscoveredGateway, GatewaySyncStatus, RefResolutionPhase,
    SyncPhase,
};

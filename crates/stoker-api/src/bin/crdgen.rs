//! # CRD Generator
//!
//! Generates the GatewaySync CustomResourceDefinition YAML from the Rust
//! type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > deploy/crd/gatewaysync.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use stoker_api::GatewaySync;

fn main() -> anyhow::Result<()> {
    let crd = GatewaySync::crd();
    println!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}

//! Support code for the `corral` binary.
//!
//! - `corral register` / `corral deregister`: manage registry entries by hand
//! - `corral list` / `corral resolve`: inspect what clients would see
//! - `corral call`: dial a service through the connection cache and call it
//! - `corral serve`: run a registered echo service behind admission control

pub mod serve;

use std::sync::Arc;

use anyhow::Context;
use corral_registry::{EtcdConfig, EtcdStore, Registry};
use serde_json::Value;

/// Builds a registry client from `--registry`, falling back to
/// `CORRAL_REGISTRY_URLS` and then the local default.
pub fn connect_registry(urls: Option<&str>, cluster: Option<&str>) -> anyhow::Result<Registry> {
    let config = match urls {
        Some(urls) => EtcdConfig::parse(urls),
        None => EtcdConfig::from_env(),
    };
    let store = EtcdStore::new(config).context("invalid registry configuration")?;

    let registry = Registry::new(Arc::new(store));
    Ok(match cluster {
        Some(cluster) => registry.with_cluster(cluster),
        None => registry,
    })
}

/// Parses a JSON argument string given on the command line.
pub fn parse_json_args(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))
}

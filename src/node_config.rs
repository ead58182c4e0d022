//! Shared node launch configuration for the `demos/` binaries. Operators
//! can pass flags directly or point at a TOML file; flags take
//! precedence when both are given.

use serde::Deserialize;

/// Settings common to every node in a group, loadable from a TOML file
/// via [`NodeConfig::load`].
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// This node's own listen address.
    pub listen: String,
    /// The address of the node that bootstraps view/instance 1.
    pub first: String,
    /// Percent chance (0-100) [`crate::connection::LossyConfig`] drops
    /// an outgoing frame, mirroring `RPC_LOSSY`.
    #[serde(default)]
    pub lossy_percent: u8,
}

impl NodeConfig {
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Reads `RPC_LOSSY` from the environment, falling back to `default` if
/// unset or unparsable.
pub fn lossy_from_env(default: u8) -> u8 {
    std::env::var("RPC_LOSSY").ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

//! YAML configuration for clients and servers.
//!
//! One document carries both sides (`client:` and `server:`); either may be
//! omitted and falls back to defaults. Unknown keys are rejected at every
//! level, then [`EngineConfig::validate`] checks the values.

pub mod schema;

use std::path::Path;

use postrpc_core::error::{Result, RpcError};

pub use schema::{ClientConfig, EngineConfig, ServerConfig};

pub fn load_from_file(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RpcError::Internal(format!("cannot read {}: {e}", path.display())))?;
    let cfg = load_from_str(&raw)?;
    tracing::debug!(path = %path.display(), "engine config loaded");
    Ok(cfg)
}

pub fn load_from_str(raw: &str) -> Result<EngineConfig> {
    let cfg = serde_yaml::from_str::<EngineConfig>(raw)
        .map_err(|e| RpcError::InvalidConfig(format!("config is not valid: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use postrpc_core::error::{Result, RpcError};

use crate::policy::OriginPolicy;
use crate::stream::writer::DEFAULT_CHUNK_SIZE;
use crate::stream::StreamTiming;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RpcError::UnsupportedVersion(self.version));
        }
        self.client.validate()?;
        self.server.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Tenant key; only servers with the same key see this client's traffic.
    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default = "default_target_origin")]
    pub target_origin: String,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_async_timeout_ms")]
    pub async_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub auto_open: bool,

    /// Resolve `send` with the response data only.
    #[serde(default)]
    pub return_data: bool,

    #[serde(default = "default_true")]
    pub require_ack: bool,

    /// Pin every request to one server instance.
    #[serde(default)]
    pub target_id: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            target_origin: default_target_origin(),
            ack_timeout_ms: default_ack_timeout_ms(),
            timeout_ms: default_timeout_ms(),
            async_timeout_ms: default_async_timeout_ms(),
            auto_open: true,
            return_data: false,
            require_ack: true,
            target_id: None,
            headers: BTreeMap::new(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        positive("client.ack_timeout_ms", self.ack_timeout_ms)?;
        positive("client.timeout_ms", self.timeout_ms)?;
        positive("client.async_timeout_ms", self.async_timeout_ms)?;
        positive("client.stream_idle_timeout_ms", self.stream_idle_timeout_ms)?;
        positive("client.ping_timeout_ms", self.ping_timeout_ms)?;
        if self.chunk_size == 0 {
            return Err(RpcError::InvalidConfig("client.chunk_size must be > 0".into()));
        }
        if self.target_origin.is_empty() {
            return Err(RpcError::InvalidConfig("client.target_origin must not be empty".into()));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    pub fn stream_timing(&self) -> StreamTiming {
        StreamTiming {
            idle: Duration::from_millis(self.stream_idle_timeout_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Instance id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    /// Bound on the wait for a request body's `stream_start`.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub auto_open: bool,

    /// Empty means every origin is accepted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub max_concurrent_requests_per_client: Option<usize>,

    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: None,
            secret_key: None,
            ack_timeout_ms: default_ack_timeout_ms(),
            auto_open: true,
            allowed_origins: Vec::new(),
            max_concurrent_requests_per_client: None,
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        positive("server.ack_timeout_ms", self.ack_timeout_ms)?;
        positive("server.stream_idle_timeout_ms", self.stream_idle_timeout_ms)?;
        positive("server.ping_timeout_ms", self.ping_timeout_ms)?;
        if self.chunk_size == 0 {
            return Err(RpcError::InvalidConfig("server.chunk_size must be > 0".into()));
        }
        if self.max_concurrent_requests_per_client == Some(0) {
            return Err(RpcError::InvalidConfig(
                "server.max_concurrent_requests_per_client must be >= 1".into(),
            ));
        }
        self.origin_policy()?;
        Ok(())
    }

    pub fn origin_policy(&self) -> Result<OriginPolicy> {
        if self.allowed_origins.is_empty() {
            return Ok(OriginPolicy::allow_all());
        }
        OriginPolicy::from_allowlist(&self.allowed_origins)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn stream_timing(&self) -> StreamTiming {
        StreamTiming {
            idle: Duration::from_millis(self.stream_idle_timeout_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
        }
    }
}

fn positive(name: &str, v: u64) -> Result<()> {
    if v == 0 {
        return Err(RpcError::InvalidConfig(format!("{name} must be > 0")));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}
fn default_target_origin() -> String {
    "*".into()
}
fn default_ack_timeout_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_async_timeout_ms() -> u64 {
    120_000
}
fn default_stream_idle_timeout_ms() -> u64 {
    10_000
}
fn default_ping_timeout_ms() -> u64 {
    1000
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

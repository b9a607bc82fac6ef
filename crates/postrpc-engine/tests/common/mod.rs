#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use postrpc_engine::channel::ChannelRegistry;
use postrpc_engine::config::{ClientConfig, ServerConfig};
use postrpc_engine::obs::{EngineMetrics, Observer};
use postrpc_engine::transport::memory::{MemoryHub, MemoryWindow};
use postrpc_engine::{Client, Server, ServerOptions};

/// A page embedding a frame on a private hub and registry.
pub struct Harness {
    pub hub: Arc<MemoryHub>,
    pub page: MemoryWindow,
    pub frame: MemoryWindow,
    pub registry: Arc<ChannelRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let hub = MemoryHub::new();
        let page = hub.open_window("https://page.test");
        let frame = hub.open_window("https://frame.test");
        Self {
            hub,
            page,
            frame,
            registry: ChannelRegistry::new(),
        }
    }

    pub fn server_config(key: Option<&str>) -> ServerConfig {
        ServerConfig {
            secret_key: key.map(str::to_string),
            ack_timeout_ms: 300,
            ..Default::default()
        }
    }

    pub fn client_config(key: Option<&str>) -> ClientConfig {
        ClientConfig {
            secret_key: key.map(str::to_string),
            ack_timeout_ms: 150,
            timeout_ms: 1000,
            async_timeout_ms: 3000,
            ..Default::default()
        }
    }

    pub fn server(&self, key: Option<&str>) -> Server {
        self.server_with(Self::server_config(key))
    }

    pub fn server_with(&self, cfg: ServerConfig) -> Server {
        Server::new(&self.registry, Arc::new(self.frame.clone()), cfg).unwrap()
    }

    pub fn server_observed(&self, cfg: ServerConfig, metrics: Arc<EngineMetrics>) -> Server {
        Server::with_options(
            &self.registry,
            Arc::new(self.frame.clone()),
            cfg,
            ServerOptions {
                observer: Some(metrics as Arc<dyn Observer>),
                ..Default::default()
            },
        )
        .unwrap()
    }

    pub fn client(&self, key: Option<&str>) -> Client {
        self.client_with(Self::client_config(key))
    }

    pub fn client_with(&self, cfg: ClientConfig) -> Client {
        Client::new(&self.registry, Arc::new(self.page.clone()), self.frame.id().clone(), cfg).unwrap()
    }

    pub fn client_observed(&self, cfg: ClientConfig, metrics: Arc<EngineMetrics>) -> Client {
        Client::with_observer(
            &self.registry,
            Arc::new(self.page.clone()),
            self.frame.id().clone(),
            cfg,
            metrics,
        )
        .unwrap()
    }
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

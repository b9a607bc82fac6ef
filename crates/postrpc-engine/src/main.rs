//! postrpc demo
//!
//! Runs a page and an embedded frame on the in-memory window hub:
//! - server in the frame with a sync route, an async route and a file route
//! - client in the page calling each of them
//! - metrics dump at the end

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use postrpc_core::protocol::FilePayload;
use postrpc_engine::channel::ChannelRegistry;
use postrpc_engine::config;
use postrpc_engine::obs::{EngineMetrics, Observer};
use postrpc_engine::server::{sync_handler, HandlerResult};
use postrpc_engine::transport::memory::MemoryHub;
use postrpc_engine::{Client, RequestOptions, ResponseBody, Server, ServerOptions, ServerRequest, ServerResponse};

const DEMO_CONFIG: &str = r#"
version: 1
client:
  secret_key: "demo"
  timeout_ms: 2000
server:
  secret_key: "demo"
  max_concurrent_requests_per_client: 8
"#;

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = match std::env::args().nth(1) {
        Some(path) => config::load_from_file(&path),
        None => config::load_from_str(DEMO_CONFIG),
    }
    .expect("config load failed");

    let hub = MemoryHub::new();
    let page = hub.open_window("https://page.test");
    let frame = hub.open_window("https://frame.test");
    let registry = ChannelRegistry::new();
    let metrics = Arc::new(EngineMetrics::default());

    let server = Server::with_options(
        &registry,
        Arc::new(frame.clone()),
        cfg.server,
        ServerOptions {
            observer: Some(metrics.clone() as Arc<dyn Observer>),
            ..Default::default()
        },
    )
    .expect("server setup failed");

    server.on(
        "hello/:name",
        sync_handler(|req: &ServerRequest, _res: &ServerResponse| -> HandlerResult {
            Ok(Some(json!({ "greeting": format!("hello {}", req.param("name").unwrap_or("?")) })))
        }),
    );
    server.on("slow", |_req: ServerRequest, res: ServerResponse| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        res.send(json!({ "ok": true }));
        Ok(None)
    });
    server.on("file", |_req: ServerRequest, res: ServerResponse| async move {
        res.send_file(FilePayload::file("hello.txt", "text/plain", &b"Hello World"[..]));
        Ok(None)
    });

    let client = Client::with_observer(
        &registry,
        Arc::new(page.clone()),
        frame.id().clone(),
        cfg.client,
        metrics.clone(),
    )
    .expect("client setup failed");

    tracing::info!(connected = client.is_connect().await, "postrpc demo starting");

    for path in ["hello/world", "slow", "missing"] {
        match client.send(path, json!({}), RequestOptions::default()).await {
            Ok(reply) => tracing::info!(path, data = ?reply.data(), "reply"),
            Err(e) => tracing::warn!(path, code = %e.code, status = ?e.status(), "request failed"),
        }
    }

    match client.send("file", json!(null), RequestOptions::default()).await {
        Ok(reply) => {
            if let ResponseBody::File(f) = reply.into_body() {
                tracing::info!(name = ?f.name, mime = %f.mime_type, text = %f.text(), "file received");
            }
        }
        Err(e) => tracing::warn!(code = %e.code, "file request failed"),
    }

    client.destroy();
    server.destroy();
    println!("{}", metrics.render());
}

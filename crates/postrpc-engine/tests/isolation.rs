#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::Arc;

use serde_json::json;

use postrpc_engine::server::{sync_handler, HandlerResult};
use postrpc_engine::{RequestOptions, ServerRequest, ServerResponse};

use common::Harness;

#[tokio::test]
async fn tenants_on_one_window_only_see_their_own_traffic() {
    let h = Harness::new();
    let a = h.server(Some("tenant-a"));
    let b = h.server(Some("tenant-b"));
    assert!(!Arc::ptr_eq(a.channel(), b.channel()));

    a.on("who", sync_handler(|_req: &ServerRequest, _res: &ServerResponse| -> HandlerResult { Ok(Some(json!("a"))) }));
    b.on("who", sync_handler(|_req: &ServerRequest, _res: &ServerResponse| -> HandlerResult { Ok(Some(json!("b"))) }));

    let ca = h.client(Some("tenant-a"));
    let cb = h.client(Some("tenant-b"));
    for _ in 0..3 {
        let (ra, rb) = tokio::join!(
            ca.send("who", json!(null), RequestOptions::default()),
            cb.send("who", json!(null), RequestOptions::default()),
        );
        assert_eq!(ra.unwrap().data(), Some(&json!("a")));
        assert_eq!(rb.unwrap().data(), Some(&json!("b")));
    }
    assert_eq!(ca.server_id(), Some(a.id()));
    assert_eq!(cb.server_id(), Some(b.id()));
}

#[tokio::test]
async fn last_instance_tears_the_channel_down() {
    let h = Harness::new();
    let first = h.server(Some("demo"));
    let second = h.server(Some("demo"));
    assert_eq!(first.channel().ref_count(), 2);
    assert_eq!(h.hub.listener_count(h.frame.id()), 1);

    first.destroy();
    assert!(first.is_destroyed());
    assert_eq!(second.channel().ref_count(), 1);
    assert_eq!(h.hub.listener_count(h.frame.id()), 1);

    second.destroy();
    assert_eq!(h.hub.listener_count(h.frame.id()), 0);
    assert!(h.registry.is_empty());

    // Destroy is idempotent and a fresh instance gets a fresh channel.
    second.destroy();
    let third = h.server(Some("demo"));
    assert_eq!(third.channel().ref_count(), 1);
    assert_eq!(h.hub.listener_count(h.frame.id()), 1);
}

#[tokio::test]
async fn dropping_the_last_handle_releases_the_channel() {
    let h = Harness::new();
    {
        let client = h.client(None);
        let _clone = client.clone();
        assert_eq!(h.hub.listener_count(h.page.id()), 1);
    }
    assert_eq!(h.hub.listener_count(h.page.id()), 0);
    assert!(h.registry.is_empty());
}

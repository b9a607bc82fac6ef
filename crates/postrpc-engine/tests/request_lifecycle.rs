#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use postrpc_core::error::{ErrorCode, RequestError};
use postrpc_engine::client::{OutgoingRequest, RequestInterceptor, ResponseInterceptor};
use postrpc_engine::obs::EngineMetrics;
use postrpc_engine::server::{sync_handler, CookieOptions, HandlerResult};
use postrpc_engine::{Reply, RequestOptions, Response, ServerRequest, ServerResponse};

use common::{eventually, Harness};

fn echo(req: &ServerRequest, _res: &ServerResponse) -> HandlerResult {
    Ok(Some(json!({ "path": req.path, "body": req.body })))
}

#[tokio::test]
async fn missing_route_is_method_not_found() {
    let h = Harness::new();
    let _server = h.server(None);
    let client = h.client(None);

    let err = client
        .send("test", json!({"a": 1}), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::MethodNotFound);
    assert_eq!(err.status(), Some(404));
    assert!(err.request_id.is_some());
}

#[tokio::test]
async fn sync_handler_round_trip_remembers_the_server() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("echo", sync_handler(echo));
    let client = h.client(None);

    let reply = client
        .send("echo", json!({"n": 7}), RequestOptions::default())
        .await
        .unwrap();
    let res = reply.response().unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.status_text, "OK");
    assert_eq!(res.data().unwrap()["body"]["n"], 7);
    assert_eq!(res.responder.as_deref(), Some(server.id()));
    assert_eq!(client.server_id(), Some(server.id()));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn async_handler_switches_to_async_timeout() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("slow", |_req: ServerRequest, res: ServerResponse| async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        res.send(json!({"ok": true}));
        Ok(None)
    });

    let metrics = Arc::new(EngineMetrics::default());
    let mut cfg = Harness::client_config(None);
    // Shorter than the handler: only the ASYNC notification keeps it alive.
    cfg.timeout_ms = 40;
    let client = h.client_observed(cfg, metrics.clone());

    let reply = client.send("slow", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(reply.data(), Some(&json!({"ok": true})));
    assert_eq!(metrics.envelopes_in.get(&[("type", "ack")]), 1);
    assert_eq!(metrics.envelopes_in.get(&[("type", "async")]), 1);
    assert_eq!(metrics.envelopes_in.get(&[("type", "response")]), 1);
}

#[tokio::test]
async fn handler_returning_a_value_is_not_async() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("now", |_req: ServerRequest, _res: ServerResponse| async move { Ok(Some(json!(1))) });

    let metrics = Arc::new(EngineMetrics::default());
    let client = h.client_observed(Harness::client_config(None), metrics.clone());
    let reply = client.send("now", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(reply.data(), Some(&json!(1)));
    assert_eq!(metrics.envelopes_in.get(&[("type", "async")]), 0);
}

#[tokio::test]
async fn tenant_mismatch_times_out_waiting_for_ack() {
    let h = Harness::new();
    let server = h.server(Some("y"));
    server.on("echo", sync_handler(echo));
    let client = h.client(Some("x"));

    let err = client.send("echo", json!(null), RequestOptions::default()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AckTimeout);
    assert!(err.response.is_none());
}

#[tokio::test]
async fn without_require_ack_only_the_request_timeout_applies() {
    let h = Harness::new();
    let server = h.server(Some("y"));
    server.on("echo", sync_handler(echo));

    let mut cfg = Harness::client_config(Some("x"));
    cfg.require_ack = false;
    cfg.ack_timeout_ms = 1;
    cfg.timeout_ms = 120;
    let client = h.client_with(cfg);
    let err = client.send("echo", json!(null), RequestOptions::default()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);

    let matching = h.client(Some("y"));
    let opts = RequestOptions {
        require_ack: Some(false),
        ack_timeout: Some(Duration::from_millis(1)),
        ..Default::default()
    };
    let reply = matching.send("echo", json!(5), opts).await.unwrap();
    assert_eq!(reply.data().unwrap()["body"], 5);
}

#[tokio::test]
async fn unreachable_targets_fail_fast() {
    let h = Harness::new();
    let client = h.client(None);
    let err = client.send("x", json!(null), RequestOptions::default()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::IframeNotReady);

    h.frame.close();
    let err = client.send("x", json!(null), RequestOptions::default()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TargetWindowClosed);
}

#[tokio::test]
async fn destroy_rejects_pending_requests() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("hang", |_req: ServerRequest, _res: ServerResponse| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    });
    let client = h.client(None);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.send("hang", json!(null), RequestOptions::default()).await })
    };
    assert!(eventually(Duration::from_secs(1), || client.in_flight() == 1).await);
    client.destroy();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::ClientDestroyed);
    let err = client.send("hang", json!(null), RequestOptions::default()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ClientDestroyed);
    assert!(!client.is_connect().await);
}

#[tokio::test]
async fn return_data_unwraps_the_response() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("echo", sync_handler(echo));
    let mut cfg = Harness::client_config(None);
    cfg.return_data = true;
    let client = h.client_with(cfg);

    match client.send("echo", json!("hi"), RequestOptions::default()).await.unwrap() {
        Reply::Data(body) => assert_eq!(body.as_data().unwrap()["body"], "hi"),
        Reply::Full(_) => panic!("expected bare data"),
    }
}

#[tokio::test]
async fn is_connect_pings_the_frame() {
    let h = Harness::new();
    let client = h.client(None);
    assert!(!client.is_connect().await);

    let server = h.server(None);
    assert!(client.is_connect().await);
    server.destroy();
    assert!(!client.is_connect().await);
}

#[tokio::test]
async fn cookies_round_trip_through_set_cookie() {
    let h = Harness::new();
    let server = h.server(None);
    server.on(
        "login",
        sync_handler(|_req: &ServerRequest, res: &ServerResponse| -> HandlerResult {
            res.cookie("sid", "abc", &CookieOptions::default());
            res.cookie(
                "scoped",
                "1",
                &CookieOptions {
                    path: Some("/admin".into()),
                    ..Default::default()
                },
            );
            Ok(Some(json!("ok")))
        }),
    );
    server.on(
        "whoami",
        sync_handler(|req: &ServerRequest, _res: &ServerResponse| -> HandlerResult {
            Ok(Some(json!({ "sid": req.cookie("sid"), "scoped": req.cookie("scoped") })))
        }),
    );
    server.on(
        "logout",
        sync_handler(|_req: &ServerRequest, res: &ServerResponse| -> HandlerResult {
            res.clear_cookie("sid", None);
            Ok(Some(json!("bye")))
        }),
    );
    let client = h.client(None);

    client.send("login", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(client.get_cookie("sid", None).as_deref(), Some("abc"));

    let who = client.send("whoami", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(who.data().unwrap()["sid"], "abc");
    assert_eq!(who.data().unwrap()["scoped"], Value::Null);

    client.send("logout", json!(null), RequestOptions::default()).await.unwrap();
    assert!(client.get_cookie("sid", None).is_none());

    client.set_cookie("manual", "m", None);
    assert_eq!(client.cookies()["manual"], "m");
    client.clear_cookies();
    assert!(client.cookies().is_empty());
}

#[tokio::test]
async fn oversized_max_age_from_the_server_is_absorbed() {
    let h = Harness::new();
    let server = h.server(None);
    server.on(
        "login",
        sync_handler(|_req: &ServerRequest, res: &ServerResponse| -> HandlerResult {
            res.set_header("set-cookie", "sid=x; Path=/; Max-Age=9223372036854775807");
            Ok(Some(json!("ok")))
        }),
    );
    let client = h.client(None);

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.send("login", json!(null), RequestOptions::default()).await })
    };
    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply.data(), Some(&json!("ok")));
    assert_eq!(client.get_cookie("sid", None).as_deref(), Some("x"));
}

struct AddHeader;

#[async_trait]
impl RequestInterceptor for AddHeader {
    async fn on_request(&self, mut req: OutgoingRequest) -> Result<OutgoingRequest, RequestError> {
        req.headers.insert("x-trace".into(), "t-1".into());
        Ok(req)
    }
}

struct NotFoundAsNull;

#[async_trait]
impl ResponseInterceptor for NotFoundAsNull {
    async fn on_error(&self, err: RequestError) -> Result<Response, RequestError> {
        if err.code != ErrorCode::MethodNotFound {
            return Err(err);
        }
        Ok(Response {
            request_id: err.request_id.unwrap_or_default(),
            path: String::new(),
            status: 404,
            status_text: "Not Found".into(),
            headers: Default::default(),
            body: postrpc_engine::ResponseBody::Data(Value::Null),
            responder: None,
        })
    }
}

#[tokio::test]
async fn interceptors_wrap_every_call() {
    let h = Harness::new();
    let server = h.server(None);
    server.on(
        "headers",
        sync_handler(|req: &ServerRequest, _res: &ServerResponse| -> HandlerResult {
            Ok(Some(json!({ "trace": req.header("X-Trace"), "app": req.header("x-app") })))
        }),
    );
    let mut cfg = Harness::client_config(None);
    cfg.headers.insert("X-App".into(), "demo".into());
    let client = h.client_with(cfg);
    client.use_request(Arc::new(AddHeader));
    client.use_response(Arc::new(NotFoundAsNull));

    let reply = client.send("headers", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(reply.data().unwrap()["trace"], "t-1");
    assert_eq!(reply.data().unwrap()["app"], "demo");

    let recovered = client.send("nope", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(recovered.response().unwrap().status, 404);
}

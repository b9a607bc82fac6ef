#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use postrpc_core::error::{ErrorCode, RequestError};
use postrpc_core::protocol::{Envelope, FilePayload, MessageType, StreamKind};
use postrpc_engine::obs::EngineMetrics;
use postrpc_engine::server::HandlerError;
use postrpc_engine::stream::{Chunk, StreamOptions, StreamSource};
use postrpc_engine::transport::Transport;
use postrpc_engine::{RequestOptions, ResponseBody, ServerRequest, ServerResponse};

use common::Harness;

fn small_chunks() -> RequestOptions {
    RequestOptions {
        stream: StreamOptions {
            chunk_size: 4,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn file_response_resolves_to_a_buffered_file() {
    let h = Harness::new();
    let mut cfg = Harness::server_config(None);
    cfg.chunk_size = 4;
    let server = h.server_with(cfg);
    server.on("file", |_req: ServerRequest, res: ServerResponse| async move {
        res.set_header("x-origin", "disk");
        res.send_file(FilePayload::file("test.txt", "text/plain", &b"Hello World"[..]));
        Ok(None)
    });
    let client = h.client(None);

    let reply = client.send("file", json!(null), RequestOptions::default()).await.unwrap();
    let res = reply.response().unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.header("x-origin"), Some("disk"));
    let file = reply.into_body().into_file().unwrap();
    assert_eq!(file.name.as_deref(), Some("test.txt"));
    assert_eq!(file.mime_type, "text/plain");
    assert_eq!(file.text(), "Hello World");
}

#[tokio::test]
async fn uploaded_file_is_buffered_before_the_handler() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("upload", |req: ServerRequest, _res: ServerResponse| async move {
        let Some(file) = req.file.as_ref() else {
            return Err(HandlerError::new("no file"));
        };
        Ok(Some(json!({
            "name": file.name,
            "type": file.mime_type,
            "size": file.len(),
            "text": file.text(),
            "stream": req.stream.is_some(),
        })))
    });
    let client = h.client(None);

    let payload = FilePayload::file("notes.md", "text/markdown", &b"# postrpc upload"[..]);
    let reply = client.send_file("upload", payload, small_chunks()).await.unwrap();
    let data = reply.data().unwrap();
    assert_eq!(data["name"], "notes.md");
    assert_eq!(data["type"], "text/markdown");
    assert_eq!(data["size"], 16);
    assert_eq!(data["text"], "# postrpc upload");
    assert_eq!(data["stream"], false);

    let blob = FilePayload::blob("application/octet-stream", vec![0u8, 1, 2, 3, 4, 5, 6]);
    let reply = client.send_file("upload", blob, small_chunks()).await.unwrap();
    assert_eq!(reply.data().unwrap()["name"], Value::Null);
    assert_eq!(reply.data().unwrap()["size"], 7);
}

#[tokio::test]
async fn streamed_request_items_reach_the_handler_live() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("sum", |mut req: ServerRequest, _res: ServerResponse| async move {
        let Some(body) = req.take_stream() else {
            return Err(HandlerError::new("expected a stream"));
        };
        if body.kind() != StreamKind::Generic {
            return Err(HandlerError::new("expected generic items"));
        }
        match body.collect_items().await {
            Ok(items) => {
                let total: i64 = items.iter().filter_map(Value::as_i64).sum();
                Ok(Some(json!({ "count": items.len(), "total": total })))
            }
            Err(e) => Err(HandlerError::from(e)),
        }
    });
    let client = h.client(None);

    let items = stream::iter((1..=5).map(|n| Ok::<Value, RequestError>(json!(n))));
    let reply = client
        .send_stream("sum", StreamSource::items(items), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.data(), Some(&json!({ "count": 5, "total": 15 })));
}

#[tokio::test]
async fn failing_source_surfaces_as_a_stream_error() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("sum", |mut req: ServerRequest, _res: ServerResponse| async move {
        let Some(body) = req.take_stream() else {
            return Err(HandlerError::new("expected a stream"));
        };
        match body.collect_items().await {
            Ok(items) => Ok(Some(json!(items.len()))),
            Err(e) => Err(HandlerError::from(e).with_status(422)),
        }
    });
    let client = h.client(None);

    let items = stream::iter(vec![
        Ok(json!(1)),
        Err(RequestError::new(ErrorCode::StreamError, "source broke")),
    ]);
    let err = client
        .send_stream("sum", StreamSource::items(items), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StreamError);
    assert_eq!(err.status(), Some(422));
}

#[tokio::test]
async fn generic_stream_response_is_read_incrementally() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("story", |_req: ServerRequest, res: ServerResponse| async move {
        let opts = StreamOptions {
            chunk_size: 4,
            ..Default::default()
        };
        res.status(206);
        res.send_stream(StreamSource::Text("once upon a time".into()), opts);
        Ok(None)
    });
    let client = h.client(None);

    let reply = client.send("story", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(reply.response().unwrap().status, 206);
    let ResponseBody::Stream(body) = reply.into_body() else {
        panic!("expected a live stream");
    };
    assert_eq!(body.kind(), StreamKind::Generic);

    let chunks: Vec<_> = body.into_stream().collect().await;
    assert!(chunks.len() >= 4);
    let text: String = chunks
        .into_iter()
        .map(|c| match c.unwrap() {
            Chunk::Data(Value::String(s)) => s,
            other => panic!("unexpected chunk {other:?}"),
        })
        .collect();
    assert_eq!(text, "once upon a time");
}

#[tokio::test]
async fn dropping_the_reader_stops_the_writer() {
    let h = Harness::new();
    let server = h.server(None);
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&produced);
    server.on("ticks", move |_req: ServerRequest, res: ServerResponse| {
        let counter = Arc::clone(&counter);
        async move {
            let ticks = stream::unfold(counter, |counter| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Some((Ok::<Value, RequestError>(json!(n)), counter))
            });
            res.send_stream(StreamSource::items(ticks), StreamOptions::default());
            Ok(None)
        }
    });
    let client = h.client(None);

    let reply = client.send("ticks", json!(null), RequestOptions::default()).await.unwrap();
    let mut body = reply.into_body().into_stream().unwrap();
    for expected in 0..3 {
        match body.next_chunk().await {
            Some(Ok(Chunk::Data(v))) => assert_eq!(v, json!(expected)),
            other => panic!("unexpected {other:?}"),
        }
    }
    drop(body);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let settled = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(produced.load(Ordering::SeqCst), settled);
}

/// Items after the first arrive every `gap`.
fn slow_items(count: usize, gap: Duration) -> StreamSource {
    let items = stream::unfold(0usize, move |n| async move {
        if n == count {
            return None;
        }
        if n > 0 {
            tokio::time::sleep(gap).await;
        }
        Some((Ok::<Value, RequestError>(json!(n)), n + 1))
    });
    StreamSource::items(items)
}

#[tokio::test]
async fn slow_writer_survives_idle_gaps_by_answering_pings() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("slow", |_req: ServerRequest, res: ServerResponse| async move {
        res.send_stream(slow_items(3, Duration::from_millis(100)), StreamOptions::default());
        Ok(None)
    });

    let metrics = Arc::new(EngineMetrics::default());
    let mut cfg = Harness::client_config(None);
    cfg.stream_idle_timeout_ms = 30;
    cfg.ping_timeout_ms = 200;
    let client = h.client_observed(cfg, metrics.clone());

    let reply = client.send("slow", json!(null), RequestOptions::default()).await.unwrap();
    let body = reply.into_body().into_stream().unwrap();
    let items = body.collect_items().await.unwrap();
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    assert!(metrics.envelopes_in.get(&[("type", "pong")]) >= 1);
}

#[tokio::test]
async fn vanished_writer_fails_the_reader() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("slow", |_req: ServerRequest, res: ServerResponse| async move {
        res.send_stream(slow_items(10, Duration::from_millis(500)), StreamOptions::default());
        Ok(None)
    });

    let mut cfg = Harness::client_config(None);
    cfg.stream_idle_timeout_ms = 30;
    cfg.ping_timeout_ms = 50;
    let client = h.client_with(cfg);

    let reply = client.send("slow", json!(null), RequestOptions::default()).await.unwrap();
    let mut body = reply.into_body().into_stream().unwrap();
    match body.next_chunk().await {
        Some(Ok(Chunk::Data(v))) => assert_eq!(v, json!(0)),
        other => panic!("unexpected {other:?}"),
    }
    h.frame.close();

    let next = tokio::time::timeout(Duration::from_secs(1), body.next_chunk()).await.unwrap();
    match next {
        Some(Err(err)) => assert_eq!(err.code, ErrorCode::StreamError),
        other => panic!("unexpected {other:?}"),
    }
    assert!(body.is_finished());
}

#[tokio::test]
async fn request_stream_that_never_starts_times_out() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("upload", |_req: ServerRequest, _res: ServerResponse| async move { Ok(Some(json!("unreachable"))) });

    let (_listener, mut rx) = h.page.listen();
    let env = Envelope::new(MessageType::Request, "req-orphan")
        .with_path("upload")
        .with_stream_id("stream-missing");
    h.page.post(h.frame.id(), env.to_value().unwrap(), "*").unwrap();

    let deadline = Duration::from_secs(2);
    let reply = tokio::time::timeout(deadline, async {
        loop {
            let event = rx.recv().await.unwrap();
            let env = Envelope::from_value(event.payload).unwrap();
            if env.kind == MessageType::Error {
                return env;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.request_id, "req-orphan");
    assert_eq!(reply.status, Some(408));
    assert_eq!(reply.error.unwrap().code, "STREAM_START_TIMEOUT");
}

#[tokio::test]
async fn stream_frames_for_unknown_ids_are_dropped() {
    let h = Harness::new();
    let server = h.server(None);
    server.on("ping", |_req: ServerRequest, _res: ServerResponse| async move { Ok(Some(json!("pong"))) });
    let client = h.client(None);

    let stray = Envelope::new(MessageType::StreamData, "nobody")
        .with_stream_id("no-such-stream")
        .with_body(json!({ "data": 1, "done": true }));
    h.page.post(h.frame.id(), stray.to_value().unwrap(), "*").unwrap();

    let reply = client.send("ping", json!(null), RequestOptions::default()).await.unwrap();
    assert_eq!(reply.data(), Some(&json!("pong")));
}

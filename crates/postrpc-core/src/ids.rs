//! Identifier generation for requests, streams and instances.
//!
//! Ids combine a per-process random-ish prefix (start time nanos) with a
//! monotonically increasing counter, unique per process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static SEQ: AtomicU64 = AtomicU64::new(1);

fn process_tag() -> &'static str {
    static TAG: OnceLock<String> = OnceLock::new();
    TAG.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        format!("{:x}", nanos ^ u64::from(std::process::id()).rotate_left(32))
    })
}

fn next(prefix: &str) -> String {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{seq}", process_tag())
}

pub fn request_id() -> String {
    next("req")
}

pub fn stream_id() -> String {
    next("stream")
}

pub fn instance_id(prefix: &str) -> String {
    next(prefix)
}

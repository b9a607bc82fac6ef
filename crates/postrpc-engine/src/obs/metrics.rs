//! Minimal metrics registry for the engine.
//!
//! Counter and histogram vectors with dynamic labels backed by `DashMap`.
//! Labels are flattened into sorted key vectors to keep deterministic
//! ordering. Histogram buckets are fixed in microseconds.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use postrpc_core::error::ErrorCode;
use postrpc_core::protocol::Envelope;

use super::observer::{DropReason, Observer};
use crate::context::MessageContext;

type LabelKey = Vec<(String, String)>;

fn label_key(labels: &[(&str, &str)]) -> LabelKey {
    let mut key: LabelKey = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    key.sort();
    key
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn render_labels(key: &LabelKey) -> String {
    key.iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Default)]
pub struct CounterVec {
    map: DashMap<LabelKey, AtomicU64>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} counter", name);
        for r in self.map.iter() {
            let _ = writeln!(out, "{}{{{}}} {}", name, render_labels(r.key()), r.value().load(Ordering::Relaxed));
        }
    }
}

// 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s, 30s
const BUCKETS_MICROS: [u64; 9] = [
    1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000, 30_000_000,
];

#[derive(Default)]
struct AtomicHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    buckets: [AtomicU64; 9],
}

#[derive(Default)]
pub struct HistogramVec {
    map: DashMap<LabelKey, AtomicHistogram>,
}

impl HistogramVec {
    pub fn observe(&self, labels: &[(&str, &str)], duration: Duration) {
        let hist = self.map.entry(label_key(labels)).or_default();
        let micros = duration.as_micros() as u64;
        hist.count.fetch_add(1, Ordering::Relaxed);
        hist.sum.fetch_add(micros, Ordering::Relaxed);
        for (i, &b) in BUCKETS_MICROS.iter().enumerate() {
            if micros <= b {
                hist.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for r in self.map.iter() {
            let labels = render_labels(r.key());
            let prefix = if labels.is_empty() { String::new() } else { format!("{},", labels) };
            let hist = r.value();
            for (i, &le) in BUCKETS_MICROS.iter().enumerate() {
                let _ = writeln!(out, "{}_bucket{{{}le=\"{}\"}} {}", name, prefix, le, hist.buckets[i].load(Ordering::Relaxed));
            }
            let count = hist.count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{{}le=\"+Inf\"}} {}", name, prefix, count);
            let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, hist.sum.load(Ordering::Relaxed));
            let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, count);
        }
    }
}

/// Metrics observer: plug into a client/server to count protocol traffic.
#[derive(Default)]
pub struct EngineMetrics {
    pub envelopes_in: CounterVec,
    pub envelopes_out: CounterVec,
    pub dropped: CounterVec,
    pub requests_settled: CounterVec,
    pub request_duration: HistogramVec, // microseconds
}

impl EngineMetrics {
    /// Render in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.envelopes_in.render("postrpc_envelopes_in_total", &mut out);
        self.envelopes_out.render("postrpc_envelopes_out_total", &mut out);
        self.dropped.render("postrpc_dropped_total", &mut out);
        self.requests_settled.render("postrpc_requests_settled_total", &mut out);
        self.request_duration.render("postrpc_request_duration_micros", &mut out);
        out
    }
}

impl Observer for EngineMetrics {
    fn on_inbound(&self, env: &Envelope, _ctx: &MessageContext) {
        self.envelopes_in.inc(&[("type", env.kind.as_str())]);
    }

    fn on_outbound(&self, env: &Envelope) {
        self.envelopes_out.inc(&[("type", env.kind.as_str())]);
    }

    fn on_dropped(&self, env: &Envelope, reason: DropReason) {
        self.dropped.inc(&[("type", env.kind.as_str()), ("reason", reason.as_str())]);
    }

    // Paths embed route params and are never used as labels.
    fn on_settled(&self, _path: &str, error: Option<&ErrorCode>, elapsed: Duration) {
        let code = error.map(ErrorCode::as_str).unwrap_or("OK");
        self.requests_settled.inc(&[("code", code)]);
        self.request_duration.observe(&[("code", code)], elapsed);
    }
}

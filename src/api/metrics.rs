//! `GET /metrics` Prometheus text exposition via a small hand-rolled
//! counter/gauge registry (SPEC_FULL §4.6: no `metrics`-crate dependency
//! in the teacher's stack to reuse).
//!
//! Grounded on the teacher's `api::ws::metrics::WebSocketMetrics`
//! (an `Arc<AtomicU64>` per counter with a `snapshot()` accessor),
//! generalized from a fixed WebSocket-specific field set to the
//! run/event/hub counters this service needs, and rendered as Prometheus
//! exposition text instead of a JSON snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counters, constructed once at startup and shared via
/// `AppState` (spec §9: no ambient globals).
#[derive(Clone, Default)]
pub struct Metrics {
    runs_created: Arc<AtomicU64>,
    runs_succeeded: Arc<AtomicU64>,
    runs_failed: Arc<AtomicU64>,
    runs_cancelled: Arc<AtomicU64>,
    events_appended: Arc<AtomicU64>,
    sse_connections: Arc<AtomicU64>,
    ws_connections: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_created(&self) {
        self.runs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_terminal(&self, status: crate::model::RunStatus) {
        use crate::model::RunStatus::*;
        match status {
            Succeeded => self.runs_succeeded.fetch_add(1, Ordering::Relaxed),
            Failed => self.runs_failed.fetch_add(1, Ordering::Relaxed),
            Cancelled => self.runs_cancelled.fetch_add(1, Ordering::Relaxed),
            Queued | Running => 0,
        };
    }

    pub fn record_event_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sse_connected(&self) {
        self.sse_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ws_connected(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the current snapshot as Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut gauge = |name: &str, help: &str, value: u64, out: &mut String| {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {value}\n"));
        };

        gauge(
            "mentatlab_runs_created_total",
            "Total runs created",
            self.runs_created.load(Ordering::Relaxed),
            &mut out,
        );
        gauge(
            "mentatlab_runs_succeeded_total",
            "Total runs that reached succeeded",
            self.runs_succeeded.load(Ordering::Relaxed),
            &mut out,
        );
        gauge(
            "mentatlab_runs_failed_total",
            "Total runs that reached failed",
            self.runs_failed.load(Ordering::Relaxed),
            &mut out,
        );
        gauge(
            "mentatlab_runs_cancelled_total",
            "Total runs that reached cancelled",
            self.runs_cancelled.load(Ordering::Relaxed),
            &mut out,
        );
        gauge(
            "mentatlab_events_appended_total",
            "Total events appended across all runs",
            self.events_appended.load(Ordering::Relaxed),
            &mut out,
        );
        gauge(
            "mentatlab_sse_connections_total",
            "Total SSE connections accepted",
            self.sse_connections.load(Ordering::Relaxed),
            &mut out,
        );
        gauge(
            "mentatlab_ws_connections_total",
            "Total WebSocket connections accepted",
            self.ws_connections.load(Ordering::Relaxed),
            &mut out,
        );
        out
    }
}

//! Driver: executes a single agent node's side effect and streams its
//! output back as events. Two implementations share the `Driver` trait —
//! `local::LocalProcessDriver` (spawns a subprocess) and, behind the
//! `k8s-driver` feature, `container::ContainerJobDriver` (submits a
//! Kubernetes Job and tails its pod logs) — so the Scheduler never needs
//! to know which `RunMode` is active.
//!
//! Grounded on the teacher's `execution::streaming::ExecutionStreamHandler`
//! (an mpsc channel of typed events with an active/closed flag) and
//! `execution::workflow_engine::WorkflowExecutionEngine::execute_node`
//! (one entry point per node, one terminal result).

pub mod local;
pub mod parse;

#[cfg(feature = "k8s-driver")]
pub mod container;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::NodeSpec;

/// Seconds to wait after SIGTERM before escalating to SIGKILL.
pub const SIGTERM_GRACE_PERIOD_SECS: u64 = 5;

/// Exit code convention used across both driver implementations.
pub const EXIT_CODE_TIMEOUT: i32 = 124;
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Everything a driver needs to run one node.
pub struct DriverContext {
    pub run_id: String,
    pub node: NodeSpec,
    /// Merged environment: node.env plus RUN_ID/NODE_ID and any ambient
    /// variables the caller wants forwarded.
    pub env: HashMap<String, String>,
    pub cancel: CancellationToken,
}

/// A line of driver output, already classified. `Log`/`StreamData` map
/// directly onto `EventType`; `Unrecognized` preserves raw, non-NDJSON
/// output as a log line rather than dropping it.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Log { message: String },
    Progress { data: serde_json::Value },
    Checkpoint { data: serde_json::Value },
    StreamData { data: serde_json::Value },
    Error { message: String },
}

/// Terminal result of a node execution.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl DriverOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == 0
    }
}

/// Executes a node and streams its output. Implementations must respect
/// `ctx.cancel` promptly and must never block past `node.timeout`.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn execute(
        &self,
        ctx: DriverContext,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<DriverOutcome>;
}

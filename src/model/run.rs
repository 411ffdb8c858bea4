//! Run: one execution of a Plan. Status transitions are restricted to the
//! DAG `queued -> running -> {succeeded, failed, cancelled}` (spec §3
//! invariant 2); only `queued`/`running` may move to `cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::model::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Validate a transition against spec §3 invariant 2.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// How a run was created — mirrors the `mode` query parameter of
/// `POST /runs`. `Plan` mode never persists a run; it only validates and
/// echoes back the compiled plan steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Plan,
    Redis,
    K8s,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: RunStatus,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: impl Into<String>, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: None,
            status: RunStatus::Queued,
            plan,
            started_at: None,
            finished_at: None,
            error: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status transition, stamping `started_at`/`finished_at` as
    /// required. Fails with `InvalidTransition` if the move is not allowed.
    pub fn apply_status(&mut self, next: RunStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if next == RunStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::Plan;

    #[test]
    fn queued_to_running_to_succeeded_is_allowed() {
        let mut run = Run::new("r1", Plan::default());
        run.apply_status(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        run.apply_status(RunStatus::Succeeded).unwrap();
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn terminal_to_anything_is_rejected() {
        let mut run = Run::new("r1", Plan::default());
        run.apply_status(RunStatus::Running).unwrap();
        run.apply_status(RunStatus::Failed).unwrap();
        assert!(matches!(
            run.apply_status(RunStatus::Running),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn queued_can_cancel_directly() {
        let mut run = Run::new("r1", Plan::default());
        assert!(run.apply_status(RunStatus::Cancelled).is_ok());
    }
}

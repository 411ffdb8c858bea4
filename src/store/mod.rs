//! RunStore: durable storage of runs and their per-run event log, with a
//! per-run monotonic sequence generator and a live-event notification
//! channel (spec §4.1).
//!
//! Two backends satisfy the same `RunStore` trait: `memory::MemoryStore`
//! (default, bounded per-run event cap optional) and `sqlite::SqliteStore`
//! (the key-value durable backend named in spec §4.1, grounded on the
//! teacher's `db::connection::DatabaseConnection` pool wrapper). Both
//! honor the same append-then-fan-out ordering: the event is persisted and
//! visible to `list_events` before any subscriber is notified.

pub mod memory;
pub mod sqlite;
pub mod subscription;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Event, EventInput, Run, RunStatus};
use subscription::Subscription;

/// Storage contract shared by every RunStore backend.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run. Fails with `CoreError::AlreadyExists` if the id is
    /// taken.
    async fn create_run(&self, run: Run) -> Result<()>;

    /// Fetch a run by id, or `CoreError::NotFound`.
    async fn get_run(&self, run_id: &str) -> Result<Run>;

    /// Validate and apply a run status transition, appending a
    /// `run_status` event atomically with the metadata update (spec
    /// §4.1). Fails with `CoreError::InvalidTransition` otherwise.
    async fn set_status(&self, run_id: &str, status: RunStatus) -> Result<Event>;

    /// Append an event, assigning `id = last + 1` and stamping the
    /// timestamp, then return the stored record.
    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event>;

    /// Events with id > `since_id`, in ascending id order, capped at
    /// `limit` if given.
    async fn list_events(&self, run_id: &str, since_id: u64, limit: Option<usize>) -> Result<Vec<Event>>;

    /// Subscribe to the live feed of events appended after this call.
    /// Backfill via `list_events` is the caller's responsibility; the
    /// subscription must be acquired *before* that backfill read so no
    /// event is missed across the cut (spec §4.4).
    async fn subscribe_events(&self, run_id: &str) -> Result<Subscription>;

    /// The id of the most recently appended event for a run (0 if none).
    async fn last_event_id(&self, run_id: &str) -> Result<u64>;
}

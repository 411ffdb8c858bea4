//! Durable RunStore backend over SQLite. Grounded on the teacher's
//! `db::connection::DatabaseConnection` pool wrapper and the static
//! async-fn-over-pool shape of `db::repositories::workflow_repo::WorkflowRepository`.
//!
//! Event ids are assigned under a per-run `tokio::sync::Mutex` held for the
//! duration of the read-max-then-insert sequence, since SQLite gives no
//! portable "increment and return" primitive across a connection pool.
//! Live fan-out is in-process only (no cross-process pub/sub); the
//! `redis-backend` feature is the durable backend to reach for when that
//! is required.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CoreError, Result};
use crate::model::{Event, EventInput, EventType, Plan, Run, RunStatus};
use crate::store::subscription::{Subscription, SubscriberRegistry};
use crate::store::RunStore;

/// Thin pool wrapper, mirroring the teacher's `DatabaseConnection`.
#[derive(Clone)]
pub struct SqlitePoolHandle {
    pool: Arc<SqlitePool>,
}

impl SqlitePoolHandle {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;
        Ok(())
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub struct SqliteStore {
    db: SqlitePoolHandle,
    subscribers: DashMap<String, SubscriberRegistry>,
    append_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = SqlitePoolHandle::connect(database_url).await?;
        db.run_migrations().await?;
        Ok(Self {
            db,
            subscribers: DashMap::new(),
            append_locks: DashMap::new(),
        })
    }

    fn registry_for(&self, run_id: &str) -> SubscriberRegistry {
        self.subscribers
            .entry(run_id.to_string())
            .or_insert_with(SubscriberRegistry::new)
            .clone()
    }

    fn append_lock_for(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        self.append_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn insert_event(&self, run_id: &str, input: EventInput) -> Result<Event> {
        let lock = self.append_lock_for(run_id);
        let _guard = lock.lock().await;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT MAX(id) FROM events WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(self.db.pool())
                .await?;
        let next_id = row.map(|(id,)| id).unwrap_or(0) as u64 + 1;
        let timestamp = Utc::now();
        let data_json = serde_json::to_string(&input.data)?;

        sqlx::query(
            "INSERT INTO events (run_id, id, type, node_id, timestamp, data_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(next_id as i64)
        .bind(input.event_type.as_str())
        .bind(&input.node_id)
        .bind(timestamp.to_rfc3339())
        .bind(&data_json)
        .execute(self.db.pool())
        .await?;

        let event = Event {
            id: next_id,
            run_id: run_id.to_string(),
            event_type: input.event_type,
            node_id: input.node_id,
            timestamp,
            data: input.data,
        };
        self.registry_for(run_id).publish(&event);
        Ok(event)
    }
}

fn event_type_from_str(s: &str) -> Result<EventType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| CoreError::Storage(format!("unknown event type in storage: {s}")))
}

fn run_status_from_str(s: &str) -> Result<RunStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| CoreError::Storage(format!("unknown run status in storage: {s}")))
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, run: Run) -> Result<()> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM runs WHERE id = ?")
            .bind(&run.id)
            .fetch_optional(self.db.pool())
            .await?;
        if existing.is_some() {
            return Err(CoreError::AlreadyExists(format!("run {}", run.id)));
        }

        let plan_json = serde_json::to_string(&run.plan)?;
        let metadata_json = serde_json::to_string(&run.metadata)?;

        sqlx::query(
            "INSERT INTO runs (id, name, status, plan_json, started_at, finished_at, error,
                                metadata_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(&plan_json)
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.finished_at.map(|t| t.to_rfc3339()))
        .bind(&run.error)
        .bind(&metadata_json)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let row = sqlx::query(
            "SELECT id, name, status, plan_json, started_at, finished_at, error,
                    metadata_json, created_at, updated_at
             FROM runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))?;

        let plan_json: String = row.try_get("plan_json")?;
        let metadata_json: String = row.try_get("metadata_json")?;
        let status_str: String = row.try_get("status")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let finished_at: Option<String> = row.try_get("finished_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Run {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: run_status_from_str(&status_str)?,
            plan: serde_json::from_str::<Plan>(&plan_json)?,
            started_at: parse_optional_rfc3339(started_at)?,
            finished_at: parse_optional_rfc3339(finished_at)?,
            error: row.try_get("error")?,
            metadata: serde_json::from_str(&metadata_json)?,
            created_at: parse_rfc3339(&created_at)?,
            updated_at: parse_rfc3339(&updated_at)?,
        })
    }

    async fn set_status(&self, run_id: &str, status: RunStatus) -> Result<Event> {
        let mut run = self.get_run(run_id).await?;
        run.apply_status(status)?;

        sqlx::query(
            "UPDATE runs SET status = ?, started_at = ?, finished_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.finished_at.map(|t| t.to_rfc3339()))
        .bind(run.updated_at.to_rfc3339())
        .bind(run_id)
        .execute(self.db.pool())
        .await?;

        let input = EventInput::new(EventType::RunStatus).with_data(serde_json::json!({
            "status": status.as_str(),
        }));
        self.insert_event(run_id, input).await
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event> {
        self.insert_event(run_id, input).await
    }

    async fn list_events(&self, run_id: &str, since_id: u64, limit: Option<usize>) -> Result<Vec<Event>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT id, type, node_id, timestamp, data_json FROM events
             WHERE run_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(run_id)
        .bind(since_id as i64)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Event> {
                let id: i64 = row.try_get("id")?;
                let type_str: String = row.try_get("type")?;
                let timestamp: String = row.try_get("timestamp")?;
                let data_json: String = row.try_get("data_json")?;
                Ok(Event {
                    id: id as u64,
                    run_id: run_id.to_string(),
                    event_type: event_type_from_str(&type_str)?,
                    node_id: row.try_get("node_id")?,
                    timestamp: parse_rfc3339(&timestamp)?,
                    data: serde_json::from_str(&data_json)?,
                })
            })
            .collect()
    }

    async fn subscribe_events(&self, run_id: &str) -> Result<Subscription> {
        // Confirm the run exists before handing back a subscription.
        self.get_run(run_id).await?;
        Ok(self.registry_for(run_id).subscribe())
    }

    async fn last_event_id(&self, run_id: &str) -> Result<u64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT MAX(id) FROM events WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|(id,)| id).unwrap_or(0) as u64)
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Storage(format!("bad timestamp in storage: {e}")))
}

fn parse_optional_rfc3339(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_rfc3339(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_run(id: &str) -> Run {
        Run::new(id, Plan::default())
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = new_store().await;
        store.create_run(sample_run("r1")).await.unwrap();
        let run = store.get_run("r1").await.unwrap();
        assert_eq!(run.id, "r1");
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = new_store().await;
        store.create_run(sample_run("r1")).await.unwrap();
        assert!(matches!(
            store.create_run(sample_run("r1")).await,
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn event_ids_are_dense_and_monotonic() {
        let store = new_store().await;
        store.create_run(sample_run("r1")).await.unwrap();
        let e1 = store
            .append_event("r1", EventInput::new(EventType::Log))
            .await
            .unwrap();
        let e2 = store
            .append_event("r1", EventInput::new(EventType::Log))
            .await
            .unwrap();
        assert_eq!(e1.id, 1);
        assert_eq!(e2.id, 2);
        assert_eq!(store.last_event_id("r1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn set_status_persists_and_appends_run_status_event() {
        let store = new_store().await;
        store.create_run(sample_run("r1")).await.unwrap();
        let event = store.set_status("r1", RunStatus::Running).await.unwrap();
        assert_eq!(event.event_type, EventType::RunStatus);
        let run = store.get_run("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
    }

    #[tokio::test]
    async fn list_events_respects_since_id() {
        let store = new_store().await;
        store.create_run(sample_run("r1")).await.unwrap();
        for _ in 0..3 {
            store
                .append_event("r1", EventInput::new(EventType::Log))
                .await
                .unwrap();
        }
        let events = store.list_events("r1", 1, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 2);
    }
}

//! In-memory RunStore backend: the default store, suitable for a single
//! process instance or for tests. Grounded on the teacher's
//! `api::ws::replay::EventHistory` (a per-stream `Vec<Event>` behind a
//! lock with a monotonic counter) generalized to also hold run metadata.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::model::{Event, EventInput, EventType, Run, RunStatus};
use crate::store::subscription::{Subscription, SubscriberRegistry};
use crate::store::RunStore;

struct RunEntry {
    run: Run,
    events: Vec<Event>,
    next_id: u64,
    subscribers: SubscriberRegistry,
}

impl RunEntry {
    fn new(run: Run) -> Self {
        Self {
            run,
            events: Vec::new(),
            next_id: 1,
            subscribers: SubscriberRegistry::new(),
        }
    }

    fn append(&mut self, run_id: &str, input: EventInput) -> Event {
        let event = Event {
            id: self.next_id,
            run_id: run_id.to_string(),
            event_type: input.event_type,
            node_id: input.node_id,
            timestamp: Utc::now(),
            data: input.data,
        };
        self.next_id += 1;
        self.events.push(event.clone());
        self.subscribers.publish(&event);
        event
    }
}

/// Default RunStore backend, holding every run's state and event log in
/// process memory behind a per-run lock.
pub struct MemoryStore {
    runs: Mutex<HashMap<String, Arc<Mutex<RunEntry>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, run_id: &str) -> Result<Arc<Mutex<RunEntry>>> {
        self.runs
            .lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("run {run_id}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: Run) -> Result<()> {
        let mut runs = self.runs.lock();
        if runs.contains_key(&run.id) {
            return Err(CoreError::AlreadyExists(format!("run {}", run.id)));
        }
        runs.insert(run.id.clone(), Arc::new(Mutex::new(RunEntry::new(run))));
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let entry = self.entry(run_id)?;
        let guard = entry.lock();
        Ok(guard.run.clone())
    }

    async fn set_status(&self, run_id: &str, status: RunStatus) -> Result<Event> {
        let entry = self.entry(run_id)?;
        let mut guard = entry.lock();
        guard.run.apply_status(status)?;
        let input = EventInput::new(EventType::RunStatus).with_data(serde_json::json!({
            "status": status.as_str(),
        }));
        Ok(guard.append(run_id, input))
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event> {
        let entry = self.entry(run_id)?;
        let mut guard = entry.lock();
        Ok(guard.append(run_id, input))
    }

    async fn list_events(&self, run_id: &str, since_id: u64, limit: Option<usize>) -> Result<Vec<Event>> {
        let entry = self.entry(run_id)?;
        let guard = entry.lock();
        let mut out: Vec<Event> = guard
            .events
            .iter()
            .filter(|e| e.id > since_id)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn subscribe_events(&self, run_id: &str) -> Result<Subscription> {
        let entry = self.entry(run_id)?;
        let guard = entry.lock();
        Ok(guard.subscribers.subscribe())
    }

    async fn last_event_id(&self, run_id: &str) -> Result<u64> {
        let entry = self.entry(run_id)?;
        let guard = entry.lock();
        Ok(guard.events.last().map(|e| e.id).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Plan;

    fn sample_run(id: &str) -> Run {
        Run::new(id, Plan::default())
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = MemoryStore::new();
        store.create_run(sample_run("r1")).await.unwrap();
        let run = store.get_run("r1").await.unwrap();
        assert_eq!(run.id, "r1");
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = MemoryStore::new();
        store.create_run(sample_run("r1")).await.unwrap();
        assert!(matches!(
            store.create_run(sample_run("r1")).await,
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn event_ids_are_dense_and_monotonic() {
        let store = MemoryStore::new();
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
    async fn list_events_respects_since_id_and_limit() {
        let store = MemoryStore::new();
        store.create_run(sample_run("r1")).await.unwrap();
        for _ in 0..5 {
            store
                .append_event("r1", EventInput::new(EventType::Log))
                .await
                .unwrap();
        }
        let events = store.list_events("r1", 2, Some(2)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 3);
        assert_eq!(events[1].id, 4);
    }

    #[tokio::test]
    async fn subscribe_before_append_sees_subsequent_events() {
        let store = MemoryStore::new();
        store.create_run(sample_run("r1")).await.unwrap();
        let mut sub = store.subscribe_events("r1").await.unwrap();
        store
            .append_event("r1", EventInput::new(EventType::Log))
            .await
            .unwrap();
        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, 1);
    }

    #[tokio::test]
    async fn invalid_status_transition_is_rejected() {
        let store = MemoryStore::new();
        store.create_run(sample_run("r1")).await.unwrap();
        store.set_status("r1", RunStatus::Running).await.unwrap();
        store.set_status("r1", RunStatus::Succeeded).await.unwrap();
        assert!(matches!(
            store.set_status("r1", RunStatus::Running).await,
            Err(CoreError::InvalidTransition { .. })
        ));
    }
}

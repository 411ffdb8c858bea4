//! `GET /runs/{id}/events` — Server-Sent Events transport (spec §4.4).
//!
//! Sends a connection-level `hello` frame first, then replays backfill
//! (via `Last-Event-ID` or `?replay=N`, clamped `[0,100]`), then streams
//! the RunStore's live feed. The subscription is acquired before the
//! backfill read so no event is missed across the cut (spec §4.4/§8
//! invariant 2).
//!
//! Grounded on axum's own `response::sse` primitive (the idiomatic axum
//! SSE endpoint shape) combined with this crate's `store::subscription`
//! channel discipline; the teacher has no SSE endpoint of its own, so the
//! nearest sibling pattern is its `api::ws::handler` connection lifecycle
//! (subscribe, pump, disconnect on closed channel).

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::model::Event;

const SSE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub replay: Option<u32>,
}

/// Decide the `since_id` cut for backfill: `Last-Event-ID` header wins
/// over `?replay=N` (spec §6: "Request header Last-Event-ID takes
/// precedence over replay").
async fn resolve_since_id(
    headers: &HeaderMap,
    query: &ReplayQuery,
    state: &AppState,
    run_id: &str,
) -> ApiResult<u64> {
    if let Some(last_event_id) = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        return Ok(last_event_id);
    }

    let requested = query.replay.unwrap_or(state.config.sse_default_replay);
    let clamped = requested.min(state.config.sse_max_replay) as u64;
    let last_id = state.store.last_event_id(run_id).await?;
    Ok(last_id.saturating_sub(clamped))
}

fn to_sse_event(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.id_str())
        .event(event.event_type.as_str())
        .json_data(event)
        .unwrap_or_else(|_| SseEvent::default().event("error").data("failed to encode event"))
}

pub async fn sse_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    state.store.get_run(&run_id).await?;

    // Subscribe before computing the backfill cut so no event appended
    // in between is missed.
    let mut subscription = state.store.subscribe_events(&run_id).await?;
    let since_id = resolve_since_id(&headers, &query, &state, &run_id).await?;
    let backfill = state.store.list_events(&run_id, since_id, None).await?;

    state.metrics.record_sse_connected();

    let (tx, rx) = mpsc::channel::<SseEvent>(SSE_CHANNEL_CAPACITY);
    let hello = SseEvent::default()
        .event("hello")
        .json_data(serde_json::json!({ "run_id": run_id }))
        .unwrap_or_else(|_| SseEvent::default().event("hello"));

    tokio::spawn(async move {
        if tx.send(hello).await.is_err() {
            return;
        }
        for event in &backfill {
            if tx.send(to_sse_event(event)).await.is_err() {
                return;
            }
        }
        while let Some(event) = subscription.recv().await {
            if tx.send(to_sse_event(&event)).await.is_err() {
                return;
            }
        }
        // Subscription closed (store shutdown or we fell behind): the
        // receiver side drops and the SSE connection ends, per the
        // slow-subscriber disconnect-and-reconnect policy.
    });

    let stream = ReceiverStream::new(rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.sse_heartbeat_interval)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{EventType, Run};
    use crate::store::memory::MemoryStore;
    use crate::store::RunStore;
    use std::sync::Arc;

    fn heartbeat_config() -> crate::config::Config {
        let mut config = Config::load().unwrap();
        config.sse_default_replay = 10;
        config.sse_max_replay = 100;
        config
    }

    #[tokio::test]
    async fn resolve_since_id_prefers_last_event_id_header() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        store.create_run(Run::new("r1", crate::model::Plan::default())).await.unwrap();
        for _ in 0..5 {
            store.append_event("r1", crate::model::EventInput::new(EventType::Log)).await.unwrap();
        }

        let config = Arc::new(heartbeat_config());
        let rate_limiter = Arc::new(crate::api::rate_limit::RateLimiter::new(config.rate_limit));
        let state = AppState {
            store: store.clone(),
            local_driver: Arc::new(crate::driver::local::LocalProcessDriver::new()),
            #[cfg(feature = "k8s-driver")]
            k8s_driver: None,
            collaborators: crate::collaborators::Collaborators::in_memory(),
            hub: Arc::new(crate::hub::Hub::new()),
            config: config.clone(),
            rate_limiter,
            metrics: Arc::new(crate::api::metrics::Metrics::new()),
            active_runs: Arc::new(dashmap::DashMap::new()),
        };

        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", "3".parse().unwrap());
        let since = resolve_since_id(&headers, &ReplayQuery { replay: Some(1) }, &state, "r1").await.unwrap();
        assert_eq!(since, 3);
    }

    #[tokio::test]
    async fn resolve_since_id_falls_back_to_clamped_replay() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        store.create_run(Run::new("r1", crate::model::Plan::default())).await.unwrap();
        for _ in 0..5 {
            store.append_event("r1", crate::model::EventInput::new(EventType::Log)).await.unwrap();
        }

        let config = Arc::new(heartbeat_config());
        let rate_limiter = Arc::new(crate::api::rate_limit::RateLimiter::new(config.rate_limit));
        let state = AppState {
            store: store.clone(),
            local_driver: Arc::new(crate::driver::local::LocalProcessDriver::new()),
            #[cfg(feature = "k8s-driver")]
            k8s_driver: None,
            collaborators: crate::collaborators::Collaborators::in_memory(),
            hub: Arc::new(crate::hub::Hub::new()),
            config: config.clone(),
            rate_limiter,
            metrics: Arc::new(crate::api::metrics::Metrics::new()),
            active_runs: Arc::new(dashmap::DashMap::new()),
        };

        let since = resolve_since_id(&HeaderMap::new(), &ReplayQuery { replay: Some(2) }, &state, "r1").await.unwrap();
        assert_eq!(since, 3);
    }
}

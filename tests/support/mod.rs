//! Shared fixtures for the scenario tests: a fully wired `AppState` over
//! `MemoryStore` plus small helpers for driving the axum router with
//! `tower::ServiceExt::oneshot` and parsing its JSON bodies.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use dashmap::DashMap;
use futures_util::StreamExt;
use tower::ServiceExt;

use mentatlab_core::api::metrics::Metrics;
use mentatlab_core::api::rate_limit::RateLimiter;
use mentatlab_core::api::routes::{create_router, AppState};
use mentatlab_core::collaborators::Collaborators;
use mentatlab_core::config::Config;
use mentatlab_core::driver::local::LocalProcessDriver;
use mentatlab_core::hub::Hub;
use mentatlab_core::store::memory::MemoryStore;
use mentatlab_core::store::RunStore;

pub fn test_app() -> (Router, AppState) {
    let config = Arc::new(Config::load().expect("config loads with no env set"));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
    let state = AppState {
        store: Arc::new(MemoryStore::new()),
        local_driver: Arc::new(LocalProcessDriver::new()),
        #[cfg(feature = "k8s-driver")]
        k8s_driver: None,
        collaborators: Collaborators::in_memory(),
        hub: Arc::new(Hub::new()),
        config,
        rate_limiter,
        metrics: Arc::new(Metrics::new()),
        active_runs: Arc::new(DashMap::new()),
    };
    (create_router(state.clone()), state)
}

pub async fn post_json(router: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

pub async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

pub async fn delete(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// An agent node whose command is a real `sh -c` one-liner, so the plan
/// can be driven through `LocalProcessDriver` without mocking anything.
pub fn shell_agent(id: &str, script: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "agent",
        "command": ["sh", "-c", script],
    })
}

/// Open an SSE connection and collect raw frame bytes for a short window.
/// The response body never completes on its own (the stream keeps the
/// connection alive), so this reads with a deadline instead of draining
/// to EOF.
pub async fn sse_request(router: &Router, uri: &str, last_event_id: Option<&str>) -> String {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(id) = last_event_id {
        builder = builder.header("last-event-id", id);
    }
    let request = builder.body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.into_body().into_data_stream();
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(chunk))) => collected.push_str(&String::from_utf8_lossy(&chunk)),
            _ => break,
        }
    }
    collected
}

/// Poll `GET /runs/{id}` until the run reaches a terminal status or the
/// attempt budget runs out.
pub async fn wait_for_terminal(router: &Router, run_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let (status, body) = get(router, &format!("/runs/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        let run_status = body["run"]["status"].as_str().unwrap();
        if matches!(run_status, "succeeded" | "failed" | "cancelled") {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("run {run_id} did not reach a terminal status in time");
}

//! Run lifecycle, checkpoint, and observability handlers (spec §6,
//! bit-exact wire shapes). Grounded on the teacher's `api::handlers`
//! module shape (one function per route, `State<AppState>` first
//! argument, `ApiResult<impl IntoResponse>` return) but returning the
//! flat JSON bodies this contract specifies rather than the teacher's
//! `{success,data}` envelope.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::AppState;
use crate::driver::Driver;
use crate::error::CoreError;
use crate::model::{CheckpointInput, EventInput, EventType, Plan, Run, RunMode, RunStatus};
use crate::scheduler::{Scheduler, SchedulerConfig};

#[derive(Debug, Deserialize)]
pub struct CreateRunQuery {
    pub mode: RunMode,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `POST /runs?mode={plan|redis|k8s}`.
pub async fn create_run(
    State(state): State<AppState>,
    Query(query): Query<CreateRunQuery>,
    body: Option<Json<CreateRunRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(r)| r).unwrap_or(CreateRunRequest {
        name: None,
        plan: Plan::default(),
        metadata: HashMap::new(),
    });
    request.plan.validate()?;

    if query.mode == RunMode::Plan {
        let steps = request.plan.topological_order();
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "mode": "plan", "plan": { "steps": steps } })),
        ));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut run = Run::new(run_id.clone(), request.plan.clone());
    run.name = request.name;
    run.metadata = request.metadata;
    state.store.create_run(run).await?;
    state.metrics.record_run_created();

    let driver = driver_for_mode(&state, query.mode)?;
    let cancel = CancellationToken::new();
    state.active_runs.insert(run_id.clone(), cancel.clone());
    state.hub.spawn_store_forwarder(state.store.clone(), run_id.clone(), cancel.clone());

    let scheduler = Scheduler::new(
        state.store.clone(),
        driver,
        state.collaborators.flows.clone(),
        SchedulerConfig { max_parallel_nodes: state.config.max_parallel_nodes, ..SchedulerConfig::default() },
    );
    let plan = request.plan;
    let run_id_for_task = run_id.clone();
    let store_for_task = state.store.clone();
    let metrics_for_task = state.metrics.clone();
    let active_runs = state.active_runs.clone();
    tokio::spawn(async move {
        if let Err(err) = scheduler.run(&run_id_for_task, plan, cancel).await {
            tracing::error!(run_id = %run_id_for_task, error = %err, "scheduler run ended in error");
        }
        if let Ok(run) = store_for_task.get_run(&run_id_for_task).await {
            metrics_for_task.record_run_terminal(run.status);
        }
        active_runs.remove(&run_id_for_task);
    });

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "runId": run_id }))))
}

fn driver_for_mode(state: &AppState, mode: RunMode) -> ApiResult<std::sync::Arc<dyn Driver>> {
    match mode {
        RunMode::Redis => Ok(state.local_driver.clone()),
        RunMode::K8s => {
            #[cfg(feature = "k8s-driver")]
            {
                state.k8s_driver.clone().ok_or_else(|| {
                    ApiError::bad_request("k8s driver is not configured on this server")
                })
            }
            #[cfg(not(feature = "k8s-driver"))]
            {
                Err(ApiError::bad_request("this server was built without k8s-driver support"))
            }
        }
        RunMode::Plan => unreachable!("mode=plan is handled before driver selection"),
    }
}

/// `GET /runs/{id}`.
pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let run = state.store.get_run(&run_id).await?;
    Ok(Json(serde_json::json!({ "run": run })))
}

/// `DELETE /runs/{id}`.
pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let run = state.store.get_run(&run_id).await?;
    if run.status.is_terminal() {
        return Err(ApiError::invalid_transition(run.status.as_str(), "cancelled"));
    }

    match state.active_runs.get(&run_id) {
        Some(cancel) => cancel.cancel(),
        None => {
            state.store.set_status(&run_id, RunStatus::Cancelled).await?;
        }
    }

    Ok(Json(serde_json::json!({ "ok": true, "status": "cancelled" })))
}

/// `POST /runs/{id}/checkpoints`.
pub async fn create_checkpoint(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(input): Json<CheckpointInput>,
) -> ApiResult<impl IntoResponse> {
    input.validate().map_err(ApiError::bad_request)?;
    state.store.get_run(&run_id).await?;

    let event = state
        .store
        .append_event(
            &run_id,
            EventInput::new(EventType::Checkpoint)
                .with_data(serde_json::json!({ "type": input.checkpoint_type, "data": input.data })),
        )
        .await?;
    state.metrics.record_event_appended();

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "checkpointId": event.id_str() }))))
}

/// `GET /runs/{id}/checkpoints`.
pub async fn list_checkpoints(State(state): State<AppState>, Path(run_id): Path<String>) -> ApiResult<impl IntoResponse> {
    state.store.get_run(&run_id).await?;
    let events = state.store.list_events(&run_id, 0, None).await?;

    let checkpoints: Vec<serde_json::Value> = events
        .into_iter()
        .filter(|e| e.event_type == EventType::Checkpoint)
        .map(|e| {
            serde_json::json!({
                "id": e.id_str(),
                "runId": e.run_id,
                "ts": e.timestamp,
                "type": e.data.get("type").cloned().unwrap_or(serde_json::Value::Null),
                "data": e.data.get("data").cloned().unwrap_or(serde_json::Value::Null),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({ "runId": run_id, "checkpoints": checkpoints })))
}

/// `GET /health` — liveness only, never touches the RunStore.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /ready` — readiness probe that checks RunStore reachability.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.last_event_id("__readiness_probe__").await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))),
        Err(CoreError::NotFound(_)) => (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "error": err.to_string() })),
        ),
    }
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

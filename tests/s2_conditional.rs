//! S2: a conditional node selects one branch and the unselected branch's
//! subtree is marked `skipped`, never executed.

mod support;

use axum::http::StatusCode;
use support::{post_json, shell_agent, sse_request, test_app, wait_for_terminal};

#[tokio::test]
async fn conditional_selects_true_branch_and_skips_false_branch() {
    let (router, _state) = test_app();

    let plan = serde_json::json!({
        "nodes": [
            {
                "id": "C",
                "type": "conditional",
                "control_flow": {
                    "conditional": {
                        "type": "if",
                        "expression": "true",
                        "branches": {
                            "true": {"targets": ["T"]},
                            "false": {"targets": ["F"]},
                        },
                    },
                },
            },
            shell_agent("T", "echo taken"),
            shell_agent("F", "echo not-taken"),
        ],
        "edges": [{"from": "C", "to": "T"}, {"from": "C", "to": "F"}],
    });
    let (status, body) = post_json(&router, "/runs?mode=redis", serde_json::json!({ "plan": plan })).await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["runId"].as_str().unwrap().to_string();

    let run = wait_for_terminal(&router, &run_id).await;
    assert_eq!(run["run"]["status"], "succeeded");

    let frames = sse_request(&router, &format!("/runs/{run_id}/events?replay=100"), None).await;
    assert!(frames.contains("event: branch_selected"));
    assert!(frames.contains(r#""branch":"true"#));
    assert!(frames.contains("event: branch_skipped"));
    assert!(frames.contains(r#""branch":"false"#));
    assert!(frames.contains(r#""node_id":"F""#));
    assert!(frames.contains(r#""status":"skipped"#));
    assert!(frames.contains(r#""node_id":"T""#));
}

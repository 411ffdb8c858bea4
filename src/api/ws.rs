//! `GET /ws/streams/{streamId}` — WebSocket upgrade onto the Event Hub
//! (spec §4.5/§6). Connection lifecycle: origin check against the
//! configured allow-list, optional pluggable auth, upgrade, then a read
//! pump (heartbeats/control frames) and a write pump (outgoing JSON
//! frames) running concurrently until either side closes.
//!
//! Grounded on the teacher's `api::ws::handler` (`ws_handler` entry
//! point plus a `BroadcastState`), expanded from the teacher's
//! placeholder (a 200 JSON stub — the teacher never actually wires up
//! `axum::extract::ws`) into a real upgrade using axum's `ws` feature,
//! with registration against this crate's `hub::Hub` instead of a single
//! global `tokio::sync::broadcast` channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};

use crate::api::routes::AppState;

/// `true` if the request's `Origin` header (if any) is allowed. No
/// `Origin` header at all (non-browser clients) is always allowed.
fn origin_allowed(headers: &HeaderMap, state: &AppState) -> bool {
    match headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => state.config.is_origin_allowed(origin),
        None => true,
    }
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&headers, &state) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    if let Some(expected) = &state.config.api_key {
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    }

    state.metrics.record_ws_connected();
    ws.on_upgrade(move |socket| handle_socket(socket, state, stream_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, stream_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut rx) = state.hub.register(stream_id.clone());

    let write_pump = async {
        while let Some(message) = rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode hub message for websocket");
                    continue;
                }
            };
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    };

    // Read pump: the client may send pings or control frames; this
    // connection is push-only for application data, so anything other
    // than a close/ping is ignored rather than acted on.
    let read_pump = async {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Binary(_) => {}
            }
        }
    };

    tokio::select! {
        _ = write_pump => {}
        _ = read_pump => {}
    }

    state.hub.unregister(&client_id);
}

//! Event Hub: topic-style fan-out of events to WebSocket subscribers by
//! stream key (spec §4.5). A stream key is either a run id, the wildcard
//! `*`, or an application-defined agent scope; a client registers under
//! one key and receives every message whose `stream_id` (or `run_id` as
//! fallback) matches, plus everything sent to `*`.
//!
//! Grounded on the teacher's `api::ws::pool::ConnectionPool` (a DashMap
//! of per-client bookkeeping behind atomics) and `store::subscription`'s
//! drop-and-close-on-overflow channel discipline in this crate, combined
//! into a single registry keyed by stream instead of pool's flat
//! client-id map. The `redis-backend` feature adds `redis_relay`, which
//! lets several Hub processes share one fan-out by publishing to and
//! subscribing from a Redis channel — matching spec §4.2's data flow
//! ("a Redis-backed channel for the Event Hub").

#[cfg(feature = "redis-backend")]
pub mod redis_relay;

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::Event;

/// Stream key clients subscribing to every event register under.
pub const WILDCARD_STREAM: &str = "*";

/// Per-client bounded queue depth before the Hub drops the client (spec
/// §4.5: "write failures or a full send queue drop the client").
pub const HUB_CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Envelope a Hub message carries. `stream_id` defaults to the event's
/// `run_id` when the producer doesn't set one explicitly, matching the
/// spec's "stream_id (or run_id as fallback)" dispatch rule.
#[derive(Debug, Clone, Serialize)]
pub struct HubMessage {
    pub stream_id: String,
    pub event: Event,
}

impl HubMessage {
    pub fn from_event(event: Event) -> Self {
        Self { stream_id: event.run_id.clone(), event }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }
}

type ClientId = String;

struct Client {
    stream_key: String,
    sender: mpsc::Sender<HubMessage>,
}

/// Multi-subscriber WebSocket broadcaster. Constructed once at startup
/// and passed explicitly to the `/ws/streams/{streamId}` handler (spec
/// §9: no ambient globals).
pub struct Hub {
    clients: DashMap<ClientId, Client>,
    by_stream: DashMap<String, Vec<ClientId>>,
}

impl Hub {
    pub fn new() -> Self {
        Self { clients: DashMap::new(), by_stream: DashMap::new() }
    }

    /// Register a new client under `stream_key`, returning its id and the
    /// receiving half of its outgoing queue. The caller (the WebSocket
    /// handler's write pump) drains the receiver until it closes.
    pub fn register(&self, stream_key: impl Into<String>) -> (ClientId, mpsc::Receiver<HubMessage>) {
        let stream_key = stream_key.into();
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(HUB_CLIENT_CHANNEL_CAPACITY);
        self.clients.insert(client_id.clone(), Client { stream_key: stream_key.clone(), sender: tx });
        self.by_stream.entry(stream_key).or_default().push(client_id.clone());
        (client_id, rx)
    }

    /// Remove a client, e.g. on disconnect or write failure.
    pub fn unregister(&self, client_id: &str) {
        if let Some((_, client)) = self.clients.remove(client_id) {
            if let Some(mut ids) = self.by_stream.get_mut(&client.stream_key) {
                ids.retain(|id| id != client_id);
            }
        }
    }

    /// Dispatch a message to every client whose stream key matches
    /// `message.stream_id`, plus every wildcard subscriber. Never blocks:
    /// a full or closed queue drops that client (spec §4.5).
    pub fn dispatch(&self, message: HubMessage) {
        let mut targets: Vec<ClientId> = Vec::new();
        if let Some(ids) = self.by_stream.get(&message.stream_id) {
            targets.extend(ids.iter().cloned());
        }
        if message.stream_id != WILDCARD_STREAM {
            if let Some(ids) = self.by_stream.get(WILDCARD_STREAM) {
                targets.extend(ids.iter().cloned());
            }
        }

        let mut dead = Vec::new();
        for client_id in targets {
            if let Some(client) = self.clients.get(&client_id) {
                if client.sender.try_send(message.clone()).is_err() {
                    dead.push(client_id);
                }
            }
        }
        for client_id in dead {
            self.unregister(&client_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn stream_subscriber_count(&self, stream_key: &str) -> usize {
        self.by_stream.get(stream_key).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Spawn a task that forwards a RunStore's live feed for `run_id`
    /// into this Hub under `run_id` as the stream key, so WebSocket
    /// subscribers on `/ws/streams/{run_id}` see the same events SSE
    /// subscribers do. Runs until the RunStore subscription closes
    /// (store shutdown) or `cancel` fires.
    pub fn spawn_store_forwarder(
        self: &Arc<Self>,
        store: Arc<dyn crate::store::RunStore>,
        run_id: String,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut subscription = match store.subscribe_events(&run_id).await {
                Ok(sub) => sub,
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "hub forwarder failed to subscribe");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => {
                        match event {
                            Some(event) => hub.dispatch(HubMessage::from_event(event)),
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Pluggable connection-time auth validator (spec §4.5: "optional
/// pluggable auth validator"). `None` means the Hub accepts any
/// connection; a `Some(token)` deployment can reject on mismatch.
pub trait HubAuthValidator: Send + Sync {
    fn validate(&self, token: Option<&str>) -> bool;
}

/// Accepts any connection — the default when no `API_KEY` is configured.
pub struct AllowAllAuth;

impl HubAuthValidator for AllowAllAuth {
    fn validate(&self, _token: Option<&str>) -> bool {
        true
    }
}

/// Requires the presented token to match a fixed shared secret.
pub struct SharedSecretAuth {
    pub secret: String,
}

impl HubAuthValidator for SharedSecretAuth {
    fn validate(&self, token: Option<&str>) -> bool {
        token == Some(self.secret.as_str())
    }
}

//! Cross-process Hub fan-out over Redis pub/sub (spec §4.2: "a
//! Redis-backed channel for the Event Hub" when more than one API
//! process serves WebSocket clients). One process's `dispatch` still
//! reaches its own local clients directly; this relay additionally
//! publishes every message to a shared channel and feeds whatever
//! arrives from other processes back into the local `Hub`.
//!
//! Grounded on `redis::Client`/`redis::aio::PubSub` usage in the pack
//! (`AsyncCommands`-based connections, `redis::Client::open`), adapted
//! to the pub/sub half of the client rather than key-value commands.

use std::sync::Arc;

use futures_util::StreamExt;
use redis::AsyncCommands;

use crate::error::{CoreError, Result};
use crate::hub::{Hub, HubMessage};

const CHANNEL: &str = "mentatlab:hub:events";

/// Publishes locally-dispatched messages onto the shared Redis channel.
/// Call alongside `Hub::dispatch` (or wrap it) so every process's local
/// fan-out also reaches siblings.
pub struct RedisPublisher {
    client: redis::Client,
}

impl RedisPublisher {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::Storage(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    pub async fn publish(&self, message: &HubMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::Storage(format!("redis connection failed: {e}")))?;
        let _: () = conn
            .publish(CHANNEL, payload)
            .await
            .map_err(|e| CoreError::Storage(format!("redis publish failed: {e}")))?;
        Ok(())
    }
}

/// Subscribes to the shared Redis channel and republishes every message
/// into the local `Hub`, so WebSocket clients connected to this process
/// see events dispatched by any process in the fleet. Runs until the
/// connection drops; the caller decides whether to retry.
pub async fn run_subscriber(redis_url: &str, hub: Arc<Hub>) -> Result<()> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| CoreError::Storage(format!("invalid redis url: {e}")))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| CoreError::Storage(format!("redis pubsub connection failed: {e}")))?;
    pubsub
        .subscribe(CHANNEL)
        .await
        .map_err(|e| CoreError::Storage(format!("redis subscribe failed: {e}")))?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed redis hub payload");
                continue;
            }
        };
        match serde_json::from_str::<HubMessage>(&payload) {
            Ok(message) => hub.dispatch(message),
            Err(err) => tracing::warn!(error = %err, "dropping unparseable redis hub message"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_an_invalid_redis_url() {
        assert!(RedisPublisher::new("not a url").is_err());
    }
}

//! Live-event subscription channel.
//!
//! Modeled as message passing over a bounded channel with drop-and-close on
//! overflow (spec §9 design notes), not a shared mutable buffer: a
//! subscriber that falls behind has its channel closed rather than
//! blocking the producer, so it must resubscribe with `Last-Event-ID` and
//! backfill via `list_events`.

use tokio::sync::mpsc;

use crate::model::Event;

/// Per-subscriber bounded queue depth before the channel is closed.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// A live handle to a run's event feed.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or `None` once the channel has been closed
    /// (either the store shut down or the subscriber fell too far behind).
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Producer-side handle used internally by a store backend to register a
/// new subscriber and to fan out appended events.
#[derive(Clone)]
pub struct SubscriberRegistry {
    senders: std::sync::Arc<parking_lot::Mutex<Vec<mpsc::Sender<Event>>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            senders: std::sync::Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber, returning the handle it should hold.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.senders.lock().push(tx);
        Subscription::new(rx)
    }

    /// Fan out an event to every live subscriber. Never blocks: a full or
    /// closed channel is dropped from the registry. Must be called only
    /// after the event has committed to the backing store (spec §4.1:
    /// "fan-out after release avoids lock inversion").
    pub fn publish(&self, event: &Event) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow subscriber: drop it, it must reconnect with
                // Last-Event-ID and replay.
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Notification sinks for dispatch events.
//!
//! Publishing is fire-and-forget: a sink must never block the caller, and a
//! delivery failure never fails the state change that produced the event.

use tokio::sync::broadcast;
use tracing::trace;

use jobrelay_core::DispatchEvent;

/// Receives dispatch events.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: DispatchEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn publish(&self, _event: DispatchEvent) {}
}

/// Fans events out to any number of subscribers (UI, live-update channel).
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DispatchEvent>,
}

impl BroadcastNotifier {
    /// Create a notifier that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn publish(&self, event: DispatchEvent) {
        // Err only means nobody is listening.
        if self.tx.send(event).is_err() {
            trace!("Dropped dispatch event - no subscribers");
        }
    }
}

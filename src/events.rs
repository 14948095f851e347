//! State-change notifications for real-time consumers.
//!
//! Stateless fan-out: an event reaches the subscribers connected when it is
//! published and nobody else. Nothing is persisted or replayed. Subscribers
//! are scoped by organization id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// A run was claimed and admission started.
pub const RUN_STARTED: &str = "campaign.run_started";
/// A run stopped admitting because a quota was exhausted.
pub const RUN_PAUSED: &str = "campaign.run_paused";
/// A run drained all of its queue work.
pub const RUN_COMPLETED: &str = "campaign.run_completed";
/// A run aborted with an error.
pub const RUN_FAILED: &str = "campaign.run_failed";
/// The provider accepted a message.
pub const MESSAGE_SENT: &str = "campaign.message_sent";
/// A send failed and was scheduled for retry.
pub const MESSAGE_RETRY: &str = "campaign.message_retry";
/// A send exhausted its retries.
pub const MESSAGE_FAILED: &str = "campaign.message_failed";

/// Destination for engine state-change events.
///
/// Fire-and-forget: implementations must not block and report no outcome.
pub trait EventSink: Send + Sync {
    /// Deliver `event` with `payload` to subscribers of `org_id`.
    fn publish(&self, org_id: &str, event: &str, payload: serde_json::Value);
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Organization the event is scoped to.
    pub org_id: String,
    /// Event name, e.g. [`MESSAGE_SENT`].
    pub name: String,
    /// Event-specific JSON object.
    pub payload: serde_json::Value,
    /// Publish time.
    pub at: DateTime<Utc>,
}

/// In-process broadcast bus.
///
/// Transports (websocket, SSE, ...) subscribe per organization and forward
/// what they receive.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus. Subscribers more than `capacity` events behind skip
    /// ahead and lose the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive future events for one organization.
    pub fn subscribe(&self, org_id: impl Into<String>) -> OrgSubscription {
        OrgSubscription {
            org_id: org_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    /// Receive future events for every organization.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventBus {
    fn publish(&self, org_id: &str, event: &str, payload: serde_json::Value) {
        let event = Event {
            org_id: org_id.to_owned(),
            name: event.to_owned(),
            payload,
            at: Utc::now(),
        };
        // No subscribers is not an error.
        match self.tx.send(event) {
            Ok(receivers) => trace!(org_id, receivers, "event published"),
            Err(broadcast::error::SendError(event)) => {
                trace!(org_id, event = %event.name, "event dropped, no subscribers");
            }
        }
    }
}

/// Organization-scoped event stream from [`EventBus::subscribe`].
#[derive(Debug)]
pub struct OrgSubscription {
    org_id: String,
    rx: broadcast::Receiver<Event>,
}

impl OrgSubscription {
    /// Organization this subscription filters on.
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// Next event for this organization, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.org_id == self.org_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(org_id = %self.org_id, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event for this organization, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.org_id == self.org_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(org_id = %self.org_id, skipped, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

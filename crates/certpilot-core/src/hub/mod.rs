//! Broadcast hub
//!
//! Fan-out of typed progress/result events to every live subscriber.
//! Nothing is persisted: a subscriber only sees events broadcast while it
//! is registered.
//!
//! ## Wire Format
//!
//! Each event is serialized once per broadcast into a JSON text frame:
//!
//! ```text
//! {"type":"lego_output","data":{"line":"[INFO] acme: Obtaining bundled SAN certificate"}}
//! ```
//!
//! ## Locking
//!
//! Membership lives behind a `RwLock`. A broadcast delivers under the read
//! lock and collects the subscribers whose delivery failed; those are then
//! pruned in a separate, short write-locked step. Delivery itself never
//! blocks: subscribers hand frames to their own queue.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Serialized event frame shared by all subscribers of one broadcast
pub type Frame = Arc<str>;

/// Events published by the engine
///
/// Variant names map to the `type` field of the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    /// Agent download progress
    DownloadProgress { message: String, percent: u8 },

    /// Agent download finished
    DownloadComplete { message: String, version: String },

    /// Agent download failed
    DownloadError { error: String },

    /// One line of agent output
    #[serde(rename = "lego_output")]
    AgentOutput { line: String },

    /// Agent run or installation finished successfully
    #[serde(rename = "lego_complete")]
    AgentComplete { message: String },

    /// Agent run or installation failed
    #[serde(rename = "lego_error")]
    AgentError { error: String },
}

impl HubEvent {
    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DownloadProgress { .. } => "download_progress",
            Self::DownloadComplete { .. } => "download_complete",
            Self::DownloadError { .. } => "download_error",
            Self::AgentOutput { .. } => "lego_output",
            Self::AgentComplete { .. } => "lego_complete",
            Self::AgentError { .. } => "lego_error",
        }
    }

    pub fn output(line: impl Into<String>) -> Self {
        Self::AgentOutput { line: line.into() }
    }

    pub fn progress(message: impl Into<String>, percent: u8) -> Self {
        Self::DownloadProgress {
            message: message.into(),
            percent,
        }
    }
}

/// Identifier handed out on registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// Delivery to a subscriber failed; the subscriber is considered dead
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError;

/// One observer of hub events
///
/// `deliver` must not block: transports queue the frame and write it from
/// their own task. Returning an error removes the subscriber from the hub.
pub trait Subscriber: Send + Sync {
    /// Queue a frame for delivery
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError>;

    /// Called once when the hub drops this subscriber after a failure
    fn close(&self) {}
}

/// Subscriber backed by an unbounded channel
///
/// The transport (for example a WebSocket writer task) drains the
/// receiving half. Dropping the receiver makes the next delivery fail.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiver its frames arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
        self.tx.send(frame.clone()).map_err(|_| DeliveryError)
    }
}

/// Receiving side of [`Hub::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

impl Subscription {
    /// Wait for the next frame and decode it
    ///
    /// Returns `None` once the subscriber has been removed from the hub.
    pub async fn next_event(&mut self) -> Option<HubEvent> {
        loop {
            let frame = self.frames.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(event) => return Some(event),
                Err(e) => debug!("Skipping undecodable frame: {}", e),
            }
        }
    }

    /// Decode every frame already queued, without waiting
    pub fn drain(&mut self) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let Ok(event) = serde_json::from_str(&frame) {
                events.push(event);
            }
        }
        events
    }
}

/// Fan-out hub
#[derive(Default)]
pub struct Hub {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl Hub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscriber);
        debug!(subscriber = id.0, "Subscriber registered");
        id
    }

    /// Register a channel-backed subscriber and return its receiving side
    pub fn subscribe(&self) -> Subscription {
        let (subscriber, frames) = ChannelSubscriber::new();
        let id = self.register(Arc::new(subscriber));
        Subscription { id, frames }
    }

    /// Remove a subscriber
    ///
    /// Returns `false` if it was not registered (already removed or pruned).
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(subscriber = id.0, "Subscriber unregistered");
        }
        removed
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every registered subscriber
    ///
    /// Serialization failures drop the event silently. Subscribers whose
    /// delivery fails are closed and removed.
    pub fn broadcast(&self, event: HubEvent) {
        let frame: Frame = match serde_json::to_string(&event) {
            Ok(json) => json.into(),
            Err(e) => {
                debug!(event = event.event_type(), "Dropping unserializable event: {}", e);
                return;
            }
        };

        let dead: Vec<SubscriberId> = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|(_, subscriber)| subscriber.deliver(&frame).is_err())
                .map(|(id, _)| *id)
                .collect()
        };

        trace!(event = event.event_type(), pruned = dead.len(), "Event broadcast");

        if dead.is_empty() {
            return;
        }

        let removed: Vec<Arc<dyn Subscriber>> = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            dead.iter().filter_map(|id| subscribers.remove(id)).collect()
        };
        for subscriber in removed {
            subscriber.close();
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_uses_type_and_data_envelope() {
        let event = HubEvent::DownloadComplete {
            message: "Lego v4.21.0 downloaded successfully".to_string(),
            version: "v4.21.0".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "download_complete");
        assert_eq!(json["data"]["version"], "v4.21.0");

        let json = serde_json::to_value(HubEvent::output("hello")).unwrap();
        assert_eq!(json["type"], "lego_output");
        assert_eq!(json["data"]["line"], "hello");
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let events = [
            HubEvent::progress("x", 5),
            HubEvent::DownloadError { error: "e".into() },
            HubEvent::output("l"),
            HubEvent::AgentComplete { message: "m".into() },
            HubEvent::AgentError { error: "e".into() },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[tokio::test]
    async fn per_subscriber_order_follows_broadcast_order() {
        let hub = Hub::new();
        let mut sub = hub.subscribe();

        for i in 0..20 {
            hub.broadcast(HubEvent::output(format!("line {i}")));
        }

        for i in 0..20 {
            assert_eq!(
                sub.next_event().await,
                Some(HubEvent::output(format!("line {i}")))
            );
        }
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = Hub::new();
        let sub = hub.subscribe();
        assert!(hub.unregister(sub.id));
        assert!(!hub.unregister(sub.id));
        assert_eq!(hub.subscriber_count(), 0);
    }
}

//! Relay lifecycle events
//!
//! Background tasks have no caller to report to, so stream and subscriber
//! lifecycle changes are published on a broadcast channel instead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{StreamId, SubscriberId};

/// Why a stream stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum EndReason {
    /// Publisher's connection failed or closed
    PublisherDisconnected,
    /// Reading from the publisher's inbound track failed
    TransportError(String),
    /// Explicit unpublish request
    Unpublished,
    /// Setup or handshake failed, the registration was rolled back
    Rejected(String),
    /// Publish request went away before its answer was sent
    Cancelled,
    /// Server shutting down
    Shutdown,
}

/// Relay lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RelayEvent {
    StreamPublished {
        stream_id: StreamId,
    },
    StreamEnded {
        stream_id: StreamId,
        reason: EndReason,
        /// Subscribers still attached when the stream ended
        subscribers: usize,
    },
    SubscriberJoined {
        stream_id: StreamId,
        subscriber_id: SubscriberId,
    },
    SubscriberLeft {
        stream_id: StreamId,
        subscriber_id: SubscriberId,
    },
}

/// Sending half of the event channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: RelayEvent) {
        trace!(event = ?event, "Relay event");
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let event = RelayEvent::StreamPublished {
            stream_id: StreamId::parse("cam1").unwrap(),
        };
        bus.emit(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new(8);
        bus.emit(RelayEvent::StreamPublished {
            stream_id: StreamId::parse("cam1").unwrap(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = RelayEvent::StreamEnded {
            stream_id: StreamId::parse("cam1").unwrap(),
            reason: EndReason::TransportError("eof".to_string()),
            subscribers: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"stream_ended\""));
        assert!(json.contains("\"kind\":\"transport_error\""));
    }
}

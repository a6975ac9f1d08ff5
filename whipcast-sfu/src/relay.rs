//! Relay facade
//!
//! Owns the registry, transport and event bus, and exposes the operations
//! the HTTP layer needs.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::events::{EventBus, RelayEvent};
use crate::publisher::PublishHandler;
use crate::registry::StreamRegistry;
use crate::signaling::Answer;
use crate::source::StreamInfo;
use crate::subscriber::SubscribeHandler;
use crate::transport::{MediaTransport, WebRtcTransport};
use crate::types::{SessionDescription, StreamId};

/// Single-process publish/subscribe media relay
pub struct Relay {
    registry: Arc<StreamRegistry>,
    events: EventBus,
    publish: PublishHandler,
    subscribe: SubscribeHandler,
}

impl Relay {
    /// Create a relay on top of an arbitrary media transport
    #[must_use]
    pub fn new(config: RelayConfig, transport: Arc<dyn MediaTransport>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(StreamRegistry::new());
        let events = EventBus::new(config.event_capacity);

        let publish = PublishHandler::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&config),
            events.clone(),
        );
        let subscribe = SubscribeHandler::new(
            Arc::clone(&registry),
            transport,
            Arc::clone(&config),
            events.clone(),
        );

        info!(
            codec = %config.codec.mime_type,
            gather_timeout_ms = config.gather_timeout_ms,
            "Relay initialized"
        );

        Self {
            registry,
            events,
            publish,
            subscribe,
        }
    }

    /// Create a relay backed by real WebRTC peer connections
    #[must_use]
    pub fn with_webrtc(config: RelayConfig) -> Self {
        let transport = Arc::new(WebRtcTransport::new(&config));
        Self::new(config, transport)
    }

    /// Start publishing `id`
    pub async fn publish(&self, id: StreamId, offer: SessionDescription) -> Result<Answer> {
        self.publish.handle(id, offer).await
    }

    /// Subscribe to `id`
    pub async fn subscribe(&self, id: StreamId, offer: SessionDescription) -> Result<Answer> {
        self.subscribe.handle(id, offer).await
    }

    /// Stop publishing `id`
    pub async fn unpublish(&self, id: &StreamId) -> Result<()> {
        self.publish.unpublish(id).await
    }

    /// Statistics for every active stream, sorted by id
    #[must_use]
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .registry
            .snapshot()
            .iter()
            .map(|source| source.info())
            .collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// End every stream
    pub async fn shutdown(&self) {
        let ended = self.publish.shutdown_all().await;
        info!(streams = ended, "Relay shut down");
    }
}

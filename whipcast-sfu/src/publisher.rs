//! Publish session handler
//!
//! Claims a stream id for an incoming publisher, negotiates its transport
//! session and pumps the first inbound track into the stream's fan-out. The
//! stream ends, and the id becomes free again, when the pump stops, the
//! transport reports the connection gone, or the publisher unpublishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::events::{EndReason, EventBus, RelayEvent};
use crate::registry::StreamRegistry;
use crate::signaling::{Answer, SignalingResponder};
use crate::source::SharedMediaSource;
use crate::transport::{InboundTrack, MediaTransport};
use crate::types::{SessionDescription, SessionRole, StreamId};

/// Handles publish (WHIP ingest) requests
#[derive(Clone)]
pub struct PublishHandler {
    registry: Arc<StreamRegistry>,
    transport: Arc<dyn MediaTransport>,
    config: Arc<RelayConfig>,
    events: EventBus,
}

impl PublishHandler {
    #[must_use]
    pub fn new(
        registry: Arc<StreamRegistry>,
        transport: Arc<dyn MediaTransport>,
        config: Arc<RelayConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            events,
        }
    }

    /// Register `id` and answer the publisher's offer.
    ///
    /// A duplicate id fails with [`Error::Conflict`] and changes nothing.
    /// Any later failure rolls the registration back.
    pub async fn handle(&self, id: StreamId, offer: SessionDescription) -> Result<Answer> {
        let source = self.registry.register(id.clone(), self.config.codec.clone())?;
        // Dropping this request before the answer goes out releases the id
        let pending = PendingPublish::new(self.clone(), Arc::clone(&source));

        let result = self.negotiate(&source, &offer).await;
        pending.disarm();

        match result {
            Ok(answer) => {
                info!(stream_id = %id, "Publisher connected");
                self.events.emit(RelayEvent::StreamPublished { stream_id: id });
                Ok(answer)
            }
            Err(e) => {
                warn!(stream_id = %id, error = %e, "Publish failed, rolling back");
                self.teardown(&source, EndReason::Rejected(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        source: &Arc<SharedMediaSource>,
        offer: &SessionDescription,
    ) -> Result<Answer> {
        let codec = source.codec();
        codec.validate()?;

        let session = self
            .transport
            .new_session(SessionRole::Publish, codec)
            .await?;
        source.attach_session(Arc::clone(&session));

        // Callbacks hold the source weakly; the source owns the session
        let pumping = AtomicBool::new(false);
        let weak = Arc::downgrade(source);
        let handler = self.clone();
        session.on_inbound_track(Box::new(move |track: Box<dyn InboundTrack>| {
            let Some(source) = weak.upgrade() else {
                return;
            };
            if pumping.swap(true, Ordering::AcqRel) {
                debug!(
                    stream_id = %source.id(),
                    ssrc = track.ssrc(),
                    "Ignoring additional inbound track"
                );
                return;
            }
            handler.spawn_pump(source, track);
        }));

        let weak = Arc::downgrade(source);
        let handler = self.clone();
        session.on_closed(Box::new(move || {
            let Some(source) = weak.upgrade() else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .teardown(&source, EndReason::PublisherDisconnected)
                    .await;
            });
        }));

        let location = SessionRole::Publish.location(source.id());
        let answer = SignalingResponder::new(session.as_ref(), self.config.gather_timeout())
            .respond(offer, location)
            .await?;

        if source.is_closed() {
            return Err(Error::Handshake(
                "publisher disconnected during handshake".to_string(),
            ));
        }
        Ok(answer)
    }

    /// Read the publisher's track until it fails or the stream is cancelled
    fn spawn_pump(&self, source: Arc<SharedMediaSource>, track: Box<dyn InboundTrack>) {
        let handler = self.clone();

        tokio::spawn(async move {
            let token = source.token().clone();
            info!(
                stream_id = %source.id(),
                ssrc = track.ssrc(),
                codec = %track.mime_type(),
                "Forwarding started"
            );

            let failure = loop {
                tokio::select! {
                    () = token.cancelled() => break None,
                    result = track.read_rtp() => match result {
                        Ok(packet) => {
                            source.write_packet(&packet).await;
                        }
                        Err(e) => break Some(e),
                    },
                }
            };

            if let Some(e) = failure {
                debug!(stream_id = %source.id(), error = %e, "Inbound track read failed");
                handler
                    .teardown(&source, EndReason::TransportError(e.to_string()))
                    .await;
            }
            debug!(stream_id = %source.id(), "Forwarding stopped");
        });
    }

    /// End the stream registered under `id`
    pub async fn unpublish(&self, id: &StreamId) -> Result<()> {
        let source = self.registry.lookup(id)?;
        self.teardown(&source, EndReason::Unpublished).await;
        Ok(())
    }

    /// End every registered stream
    pub async fn shutdown_all(&self) -> usize {
        let mut ended = 0;
        for source in self.registry.snapshot() {
            if self.teardown(&source, EndReason::Shutdown).await {
                ended += 1;
            }
        }
        ended
    }

    /// End a stream. Only the first call for a given source does anything.
    pub(crate) async fn teardown(&self, source: &Arc<SharedMediaSource>, reason: EndReason) -> bool {
        if !source.close() {
            return false;
        }

        let subscribers = source.detach_all();
        self.registry.remove(source.id(), source);
        self.finish_teardown(source, reason, subscribers).await;
        true
    }

    /// Close the publisher's session and announce the end of its stream
    async fn finish_teardown(
        &self,
        source: &Arc<SharedMediaSource>,
        reason: EndReason,
        subscribers: usize,
    ) {
        if let Some(session) = source.session() {
            session.close().await;
        }

        info!(
            stream_id = %source.id(),
            reason = ?reason,
            subscribers,
            "Stream ended"
        );
        self.events.emit(RelayEvent::StreamEnded {
            stream_id: source.id().clone(),
            reason,
            subscribers,
        });
    }
}

/// Rolls back a registration whose publish request was dropped
struct PendingPublish {
    handler: PublishHandler,
    source: Option<Arc<SharedMediaSource>>,
}

impl PendingPublish {
    fn new(handler: PublishHandler, source: Arc<SharedMediaSource>) -> Self {
        Self {
            handler,
            source: Some(source),
        }
    }

    fn disarm(mut self) {
        self.source = None;
    }
}

impl Drop for PendingPublish {
    fn drop(&mut self) {
        let Some(source) = self.source.take() else {
            return;
        };
        warn!(stream_id = %source.id(), "Publish request cancelled, rolling back");

        // Release the id right away; closing the session needs the runtime
        if !source.close() {
            return;
        }
        let subscribers = source.detach_all();
        self.handler.registry.remove(source.id(), &source);

        let handler = self.handler.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                handler
                    .finish_teardown(&source, EndReason::Cancelled, subscribers)
                    .await;
            });
        }
    }
}

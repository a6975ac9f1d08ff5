//! Subscribe session handler
//!
//! Each subscriber gets its own transport session and outbound track,
//! attached to the publisher's fan-out. A subscriber leaves when its
//! feedback stream fails, its connection closes, or the stream ends.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, RelayEvent};
use crate::registry::StreamRegistry;
use crate::signaling::{Answer, SignalingResponder};
use crate::source::SharedMediaSource;
use crate::transport::{FeedbackReader, MediaTransport, TransportSession};
use crate::types::{SessionDescription, SessionRole, StreamId, SubscriberId};

/// Handles subscribe (WHEP egress) requests
#[derive(Clone)]
pub struct SubscribeHandler {
    registry: Arc<StreamRegistry>,
    transport: Arc<dyn MediaTransport>,
    config: Arc<RelayConfig>,
    events: EventBus,
}

const PENDING: u8 = 0;
const JOINED: u8 = 1;
const LEFT: u8 = 2;

/// One subscriber's attachment to a stream
struct Membership {
    id: SubscriberId,
    source: Arc<SharedMediaSource>,
    session: Arc<dyn TransportSession>,
    events: EventBus,
    state: AtomicU8,
}

impl Membership {
    /// Mark the handshake as delivered. Fails if the subscriber already left.
    fn join(&self) -> bool {
        self.state
            .compare_exchange(PENDING, JOINED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Detach from the fan-out and close the session. Idempotent.
    async fn leave(&self) {
        let previous = self.state.swap(LEFT, Ordering::AcqRel);
        if previous == LEFT {
            return;
        }

        self.source.detach(&self.id);
        if previous == JOINED {
            info!(
                stream_id = %self.source.id(),
                subscriber_id = %self.id,
                "Subscriber left"
            );
            self.events.emit(RelayEvent::SubscriberLeft {
                stream_id: self.source.id().clone(),
                subscriber_id: self.id.clone(),
            });
        }
        self.session.close().await;
    }
}

impl SubscribeHandler {
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

    /// Attach a new subscriber to `id` and answer its offer.
    ///
    /// Fails with [`Error::NotFound`] if no publisher is registered under
    /// `id`, or if the stream ends while the subscriber is being set up.
    pub async fn handle(&self, id: StreamId, offer: SessionDescription) -> Result<Answer> {
        let source = self.registry.lookup(&id)?;
        let codec = source.codec().clone();

        let session = self
            .transport
            .new_session(SessionRole::Subscribe, &codec)
            .await?;
        let (track, feedback) = match session.add_outbound_track(&id, &codec).await {
            Ok(added) => added,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let member = Arc::new(Membership {
            id: SubscriberId::generate(),
            source: Arc::clone(&source),
            session: Arc::clone(&session),
            events: self.events.clone(),
            state: AtomicU8::new(PENDING),
        });

        // Dropping this request before the answer goes out detaches the subscriber
        let pending = PendingJoin::new(Arc::clone(&member));

        source.attach(member.id.clone(), track);
        if source.is_closed() {
            pending.disarm();
            member.leave().await;
            return Err(Error::NotFound(id));
        }

        let weak = Arc::downgrade(&member);
        session.on_closed(Box::new(move || {
            let Some(member) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move { member.leave().await });
        }));
        spawn_feedback_drain(Arc::clone(&member), feedback);

        let location = SessionRole::Subscribe.location(&id);
        let result = SignalingResponder::new(session.as_ref(), self.config.gather_timeout())
            .respond(&offer, location)
            .await;
        pending.disarm();

        match result {
            Ok(answer) if member.join() => {
                info!(
                    stream_id = %id,
                    subscriber_id = %member.id,
                    subscribers = source.subscriber_count(),
                    "Subscriber joined"
                );
                self.events.emit(RelayEvent::SubscriberJoined {
                    stream_id: id,
                    subscriber_id: member.id.clone(),
                });
                Ok(answer)
            }
            Ok(_) => {
                if source.is_closed() {
                    Err(Error::NotFound(id))
                } else {
                    Err(Error::Handshake(
                        "subscriber disconnected during handshake".to_string(),
                    ))
                }
            }
            Err(e) => {
                warn!(stream_id = %id, subscriber_id = %member.id, error = %e, "Subscribe failed");
                member.leave().await;
                Err(e)
            }
        }
    }
}

/// Detaches a subscriber whose request was dropped mid-handshake
struct PendingJoin {
    member: Option<Arc<Membership>>,
}

impl PendingJoin {
    fn new(member: Arc<Membership>) -> Self {
        Self {
            member: Some(member),
        }
    }

    fn disarm(mut self) {
        self.member = None;
    }
}

impl Drop for PendingJoin {
    fn drop(&mut self) {
        let Some(member) = self.member.take() else {
            return;
        };
        debug!(subscriber_id = %member.id, "Subscribe request cancelled");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { member.leave().await });
        }
    }
}

/// Drain control feedback for one subscriber until it fails or the stream
/// ends, then detach it
fn spawn_feedback_drain(member: Arc<Membership>, mut feedback: Box<dyn FeedbackReader>) {
    tokio::spawn(async move {
        let token = member.source.token().clone();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                result = feedback.read_rtcp() => {
                    if let Err(e) = result {
                        debug!(subscriber_id = %member.id, error = %e, "Feedback read failed");
                        break;
                    }
                }
            }
        }

        member.leave().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecProfile;
    use crate::publisher::PublishHandler;
    use crate::testing::{offer, packet, MemoryTransport};
    use std::time::Duration;

    struct Fixture {
        publish: PublishHandler,
        subscribe: SubscribeHandler,
        transport: Arc<MemoryTransport>,
        registry: Arc<StreamRegistry>,
        events: EventBus,
    }

    fn setup() -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Arc::new(StreamRegistry::new());
        let config = Arc::new(RelayConfig::default());
        let events = EventBus::new(16);
        Fixture {
            publish: PublishHandler::new(
                Arc::clone(&registry),
                transport.clone(),
                Arc::clone(&config),
                events.clone(),
            ),
            subscribe: SubscribeHandler::new(
                Arc::clone(&registry),
                transport.clone(),
                config,
                events.clone(),
            ),
            transport,
            registry,
            events,
        }
    }

    fn id(s: &str) -> StreamId {
        StreamId::parse(s).unwrap()
    }

    async fn wait_for_subscribers(source: &SharedMediaSource, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.subscriber_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_unknown_stream() {
        let fx = setup();
        let result = fx
            .subscribe
            .handle(id("doesnotexist"), offer(&CodecProfile::default()))
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(fx.transport.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_attaches_to_source() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        let mut rx = fx.events.subscribe();

        let answer = fx
            .subscribe
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();

        assert_eq!(answer.location, "/whep/cam1");
        assert!(answer.sdp.contains("H264/90000"));
        assert_eq!(fx.registry.lookup(&id("cam1")).unwrap().subscriber_count(), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            RelayEvent::SubscriberJoined { .. }
        ));
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_packets_in_order() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        let publisher = fx.transport.last_session().unwrap();

        let mut tracks = Vec::new();
        for _ in 0..2 {
            fx.subscribe
                .handle(id("cam1"), offer(&CodecProfile::default()))
                .await
                .unwrap();
            tracks.extend(fx.transport.last_session().unwrap().outbound_tracks());
        }

        let inbound = publisher.push_inbound_track();
        for seq in 1..=3 {
            inbound.send(packet(seq, &[0xAB, seq as u8])).unwrap();
        }

        for track in &tracks {
            assert!(track.wait_for(3, Duration::from_secs(2)).await);
            let packets = track.packets();
            assert_eq!(packets.len(), 3);
            for (i, p) in packets.iter().enumerate() {
                let seq = i as u16 + 1;
                assert_eq!(p.header.sequence_number, seq);
                assert_eq!(p.payload.as_ref(), &[0xAB, seq as u8]);
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_failure_detaches() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        let vp8 = CodecProfile {
            mime_type: "video/VP8".to_string(),
            ..Default::default()
        };

        let result = fx.subscribe.handle(id("cam1"), offer(&vp8)).await;

        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(fx.registry.lookup(&id("cam1")).unwrap().subscriber_count(), 0);
        assert!(fx.transport.last_session().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_detaches() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        fx.subscribe
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        let source = fx.registry.lookup(&id("cam1")).unwrap();
        let mut rx = fx.events.subscribe();

        let session = fx.transport.last_session().unwrap();
        session.disconnect();

        wait_for_subscribers(&source, 0).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            RelayEvent::SubscriberLeft { .. }
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_never_joins() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        fx.transport.hold_gathering(true);
        let mut rx = fx.events.subscribe();

        let pending = tokio::spawn({
            let subscribe = fx.subscribe.clone();
            async move {
                subscribe
                    .handle(id("cam1"), offer(&CodecProfile::default()))
                    .await
            }
        });
        let source = fx.registry.lookup(&id("cam1")).unwrap();
        wait_for_subscribers(&source, 1).await;

        let session = fx.transport.last_session().unwrap();
        assert_eq!(session.role(), SessionRole::Subscribe);
        session.disconnect();
        wait_for_subscribers(&source, 0).await;
        session.complete_gathering();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_subscribe_detaches() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        fx.transport.hold_gathering(true);

        let pending = tokio::spawn({
            let subscribe = fx.subscribe.clone();
            async move {
                subscribe
                    .handle(id("cam1"), offer(&CodecProfile::default()))
                    .await
            }
        });
        let source = fx.registry.lookup(&id("cam1")).unwrap();
        wait_for_subscribers(&source, 1).await;

        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        wait_for_subscribers(&source, 0).await;
        let session = fx.transport.last_session().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stream_end_closes_subscribers() {
        let fx = setup();
        fx.publish
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        fx.subscribe
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await
            .unwrap();
        let subscriber = fx.transport.last_session().unwrap();

        fx.publish.unpublish(&id("cam1")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !subscriber.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let result = fx
            .subscribe
            .handle(id("cam1"), offer(&CodecProfile::default()))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}

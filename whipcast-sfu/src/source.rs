//! Shared media source
//!
//! One publisher's outbound media, fanned out to every attached subscriber:
//! - Per-subscriber outbound tracks keyed by [`SubscriberId`]
//! - Sequential, order-preserving writes from the single publisher pump
//! - Removal of subscribers whose track stops accepting writes
//! - Forwarding statistics

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::util::marshal::MarshalSize;

use crate::config::CodecProfile;
use crate::transport::{OutboundTrack, RtpPacket, TransportSession};
use crate::types::{StreamId, SubscriberId};

/// Atomic forwarding counters
#[derive(Default)]
struct SourceStats {
    packets_received: AtomicU64,
    packets_forwarded: AtomicU64,
    bytes_received: AtomicU64,
    subscribers_dropped: AtomicU64,
}

/// One publisher's stream, shared by reference with every subscriber
pub struct SharedMediaSource {
    id: StreamId,
    codec: CodecProfile,

    /// Outbound tracks of the attached subscribers
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn OutboundTrack>>>,

    /// Publisher transport session; its lifetime bounds the stream's
    session: OnceLock<Arc<dyn TransportSession>>,

    /// Cancelled when the stream ends; every background task watches it
    token: CancellationToken,
    closed: AtomicBool,

    stats: SourceStats,
    created_at: Instant,
}

impl SharedMediaSource {
    pub(crate) fn new(id: StreamId, codec: CodecProfile) -> Self {
        Self {
            id,
            codec,
            subscribers: RwLock::new(HashMap::new()),
            session: OnceLock::new(),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            stats: SourceStats::default(),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    #[must_use]
    pub fn codec(&self) -> &CodecProfile {
        &self.codec
    }

    /// Bind the publisher's transport session. Only the first call wins.
    pub(crate) fn attach_session(&self, session: Arc<dyn TransportSession>) -> bool {
        self.session.set(session).is_ok()
    }

    pub(crate) fn session(&self) -> Option<&Arc<dyn TransportSession>> {
        self.session.get()
    }

    /// Token cancelled when the stream ends
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the stream ended and cancel its tasks.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Add a subscriber's outbound track to the fan-out set
    pub(crate) fn attach(&self, subscriber: SubscriberId, track: Arc<dyn OutboundTrack>) {
        let mut subscribers = self.subscribers.write();
        subscribers.insert(subscriber.clone(), track);

        debug!(
            stream_id = %self.id,
            subscriber_id = %subscriber,
            subscribers = subscribers.len(),
            "Subscriber attached"
        );
    }

    /// Remove a subscriber. Returns whether it was attached.
    pub(crate) fn detach(&self, subscriber: &SubscriberId) -> bool {
        self.subscribers.write().remove(subscriber).is_some()
    }

    /// Drop every subscriber, returning how many there were
    pub(crate) fn detach_all(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    #[must_use]
    pub fn has_subscriber(&self, subscriber: &SubscriberId) -> bool {
        self.subscribers.read().contains_key(subscriber)
    }

    /// Forward one packet, unmodified, to every attached subscriber.
    ///
    /// Subscribers whose write fails are removed from the set. Returns the
    /// number of subscribers the packet was delivered to.
    pub async fn write_packet(&self, packet: &RtpPacket) -> usize {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(packet.marshal_size() as u64, Ordering::Relaxed);

        // Writes may await; never hold the lock across them
        let targets: Vec<(SubscriberId, Arc<dyn OutboundTrack>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, track)| (id.clone(), Arc::clone(track)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (subscriber, track) in targets {
            match track.write_rtp(packet).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        stream_id = %self.id,
                        subscriber_id = %subscriber,
                        error = %e,
                        "Failed to write packet, dropping subscriber"
                    );
                    failed.push(subscriber);
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for subscriber in &failed {
                if subscribers.remove(subscriber).is_some() {
                    self.stats.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats
            .packets_forwarded
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Snapshot of this stream for monitoring
    #[must_use]
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.id.to_string(),
            mime_type: self.codec.mime_type.clone(),
            payload_type: self.codec.payload_type,
            subscribers: self.subscriber_count(),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            packets_forwarded: self.stats.packets_forwarded.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            subscribers_dropped: self.stats.subscribers_dropped.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Stream statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub mime_type: String,
    pub payload_type: u8,
    pub subscribers: usize,
    pub packets_received: u64,
    /// Sum of per-subscriber deliveries
    pub packets_forwarded: u64,
    pub bytes_received: u64,
    pub subscribers_dropped: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packet, MemoryOutboundTrack};

    fn source() -> SharedMediaSource {
        SharedMediaSource::new(StreamId::parse("cam1").unwrap(), CodecProfile::default())
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let source = source();
        let first = Arc::new(MemoryOutboundTrack::new());
        let second = Arc::new(MemoryOutboundTrack::new());
        source.attach(SubscriberId::from("a"), first.clone());
        source.attach(SubscriberId::from("b"), second.clone());

        for seq in 1..=3 {
            assert_eq!(source.write_packet(&packet(seq, &[seq as u8; 4])).await, 2);
        }

        for track in [&first, &second] {
            let seqs: Vec<u16> = track
                .packets()
                .iter()
                .map(|p| p.header.sequence_number)
                .collect();
            assert_eq!(seqs, vec![1, 2, 3]);
            assert_eq!(track.packets()[1].payload.as_ref(), &[2u8; 4]);
        }

        let info = source.info();
        assert_eq!(info.packets_received, 3);
        assert_eq!(info.packets_forwarded, 6);
    }

    #[tokio::test]
    async fn test_failed_subscriber_is_removed() {
        let source = source();
        let healthy = Arc::new(MemoryOutboundTrack::new());
        let broken = Arc::new(MemoryOutboundTrack::new());
        broken.fail_writes();
        source.attach(SubscriberId::from("healthy"), healthy.clone());
        source.attach(SubscriberId::from("broken"), broken);

        assert_eq!(source.write_packet(&packet(1, b"x")).await, 1);
        assert_eq!(source.subscriber_count(), 1);
        assert!(source.has_subscriber(&SubscriberId::from("healthy")));
        assert_eq!(source.info().subscribers_dropped, 1);

        assert_eq!(source.write_packet(&packet(2, b"y")).await, 1);
        assert_eq!(healthy.packets().len(), 2);
    }

    #[tokio::test]
    async fn test_write_without_subscribers() {
        let source = source();
        assert_eq!(source.write_packet(&packet(1, b"x")).await, 0);
        assert_eq!(source.info().packets_received, 1);
    }

    #[test]
    fn test_close_is_one_shot() {
        let source = source();
        assert!(!source.is_closed());
        assert!(source.close());
        assert!(!source.close());
        assert!(source.is_closed());
        assert!(source.token().is_cancelled());
    }

    #[test]
    fn test_detach() {
        let source = source();
        source.attach(SubscriberId::from("a"), Arc::new(MemoryOutboundTrack::new()));
        source.attach(SubscriberId::from("b"), Arc::new(MemoryOutboundTrack::new()));

        assert!(source.detach(&SubscriberId::from("a")));
        assert!(!source.detach(&SubscriberId::from("a")));
        assert_eq!(source.detach_all(), 1);
        assert_eq!(source.subscriber_count(), 0);
    }
}

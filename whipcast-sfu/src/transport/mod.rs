//! Media transport abstraction
//!
//! The relay core only needs a handful of capabilities from the underlying
//! real-time media stack: apply a remote offer, produce a local answer once
//! candidate gathering is done, receive packets from an inbound track, and
//! write packets to outbound tracks. These traits describe exactly that
//! surface so the stack can be swapped (the production implementation is
//! [`WebRtcTransport`]; tests use an in-memory one).

mod rtc;

pub use self::rtc::WebRtcTransport;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::config::CodecProfile;
use crate::error::Result;
use crate::types::{SessionDescription, SessionRole, StreamId};

/// An RTP packet, forwarded byte-for-byte
pub type RtpPacket = webrtc::rtp::packet::Packet;

/// Resolves once candidate gathering has finished
pub type GatheringComplete = BoxFuture<'static, ()>;

/// Called for every inbound track the remote peer opens
pub type InboundTrackHandler = Box<dyn Fn(Box<dyn InboundTrack>) + Send + Sync>;

/// Called when the session's connection fails or closes.
///
/// May be invoked more than once; handlers must be idempotent.
pub type ClosedHandler = Box<dyn Fn() + Send + Sync>;

/// Factory for transport sessions
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create a session negotiated with the single given codec.
    ///
    /// Publish sessions also attach the periodic picture-loss-indication
    /// generator to every inbound track.
    async fn new_session(
        &self,
        role: SessionRole,
        codec: &CodecProfile,
    ) -> Result<Arc<dyn TransportSession>>;
}

/// One negotiated media session with a remote peer
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Apply the remote peer's offer
    async fn set_remote_description(&self, offer: &SessionDescription) -> Result<()>;

    /// Build a local answer for the applied offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// One-shot signal for the end of candidate gathering.
    ///
    /// Must be obtained before [`set_local_description`](Self::set_local_description),
    /// which is what starts gathering.
    async fn gathering_complete(&self) -> GatheringComplete;

    /// Apply the local answer and start candidate gathering
    async fn set_local_description(&self, answer: &SessionDescription) -> Result<()>;

    /// The current local description, including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Register the inbound track callback
    fn on_inbound_track(&self, handler: InboundTrackHandler);

    /// Register the connection-termination callback
    fn on_closed(&self, handler: ClosedHandler);

    /// Add a send-direction track bound to `codec`.
    ///
    /// Returns the writer for media and a reader draining control feedback
    /// for that track.
    async fn add_outbound_track(
        &self,
        stream_id: &StreamId,
        codec: &CodecProfile,
    ) -> Result<(Arc<dyn OutboundTrack>, Box<dyn FeedbackReader>)>;

    /// Close the session and release its resources. Idempotent.
    async fn close(&self);
}

/// Receive side of a remote track
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn ssrc(&self) -> u32;

    fn mime_type(&self) -> String;

    /// Read the next packet, in arrival order
    async fn read_rtp(&self) -> Result<RtpPacket>;
}

/// Send side of a local track
#[async_trait]
pub trait OutboundTrack: Send + Sync {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()>;
}

/// Control feedback arriving for an outbound track
#[async_trait]
pub trait FeedbackReader: Send {
    /// Read the next batch of control packets, returning how many arrived
    async fn read_rtcp(&mut self) -> Result<usize>;
}

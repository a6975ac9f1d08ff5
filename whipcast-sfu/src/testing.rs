//! In-memory media transport
//!
//! Stands in for real peer connections in tests. Handshakes succeed whenever
//! the offer mentions the session's codec, gathering can be held open to
//! exercise slow candidates, and inbound media is injected through a
//! channel.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::CodecProfile;
use crate::error::{Error, Result};
use crate::transport::{
    ClosedHandler, FeedbackReader, GatheringComplete, InboundTrack, InboundTrackHandler,
    MediaTransport, OutboundTrack, RtpPacket, TransportSession,
};
use crate::types::{SdpKind, SessionDescription, SessionRole, StreamId};

/// Candidate block appended to local descriptions once gathering finished
const GATHERED_CANDIDATES: &str =
    "a=candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host\r\na=end-of-candidates\r\n";

/// Build an RTP packet with the given sequence number and payload
#[must_use]
pub fn packet(seq: u16, payload: &[u8]) -> RtpPacket {
    RtpPacket {
        header: webrtc::rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            ssrc: 0x1234_5678,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
}

/// SDP offer text advertising `codec`
#[must_use]
pub fn offer_sdp(codec: &CodecProfile) -> String {
    format!(
        "v=0\r\n\
         o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF {pt}\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=mid:0\r\n\
         a=rtpmap:{rtpmap}\r\n",
        pt = codec.payload_type,
        rtpmap = codec.rtpmap(),
    )
}

/// Parsed offer advertising `codec`
#[must_use]
pub fn offer(codec: &CodecProfile) -> SessionDescription {
    SessionDescription::offer(offer_sdp(codec)).expect("generated offer is well-formed")
}

/// Transport handing out [`MemorySession`]s
#[derive(Default)]
pub struct MemoryTransport {
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    fail_new_sessions: AtomicBool,
    hold_gathering: AtomicBool,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `new_session` call fail
    pub fn fail_new_sessions(&self, fail: bool) {
        self.fail_new_sessions.store(fail, Ordering::SeqCst);
    }

    /// Keep gathering open on new sessions until
    /// [`MemorySession::complete_gathering`] is called
    pub fn hold_gathering(&self, hold: bool) {
        self.hold_gathering.store(hold, Ordering::SeqCst);
    }

    /// Every session created so far, oldest first
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        self.sessions.lock().clone()
    }

    #[must_use]
    pub fn last_session(&self) -> Option<Arc<MemorySession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl MediaTransport for MemoryTransport {
    async fn new_session(
        &self,
        role: SessionRole,
        codec: &CodecProfile,
    ) -> Result<Arc<dyn TransportSession>> {
        if self.fail_new_sessions.load(Ordering::SeqCst) {
            return Err(Error::Setup("memory transport refused the session".to_string()));
        }

        let session = Arc::new(MemorySession::new(
            role,
            codec.clone(),
            self.hold_gathering.load(Ordering::SeqCst),
        ));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// In-memory transport session
pub struct MemorySession {
    role: SessionRole,
    codec: CodecProfile,
    hold_gathering: bool,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<String>>,
    gathered: watch::Sender<bool>,
    inbound_handler: Mutex<Option<Arc<InboundTrackHandler>>>,
    closed_handler: Mutex<Option<Arc<ClosedHandler>>>,
    outbound: Mutex<Vec<Arc<MemoryOutboundTrack>>>,
    closed: CancellationToken,
}

impl MemorySession {
    fn new(role: SessionRole, codec: CodecProfile, hold_gathering: bool) -> Self {
        let (gathered, _) = watch::channel(false);
        Self {
            role,
            codec,
            hold_gathering,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            gathered,
            inbound_handler: Mutex::new(None),
            closed_handler: Mutex::new(None),
            outbound: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> SessionRole {
        self.role
    }

    /// Finish candidate gathering
    pub fn complete_gathering(&self) {
        self.gathered.send_replace(true);
    }

    #[must_use]
    pub fn local_description_set(&self) -> bool {
        self.local.lock().is_some()
    }

    /// Open an inbound track as the remote peer would, returning the
    /// sender that feeds it. Dropping the sender ends the track.
    pub fn push_inbound_track(&self) -> mpsc::UnboundedSender<RtpPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = self.inbound_handler.lock().clone();
        if let Some(handler) = handler {
            handler(Box::new(MemoryInboundTrack {
                mime_type: self.codec.mime_type.clone(),
                rx: tokio::sync::Mutex::new(rx),
            }));
        }
        tx
    }

    /// Outbound tracks added to this session
    #[must_use]
    pub fn outbound_tracks(&self) -> Vec<Arc<MemoryOutboundTrack>> {
        self.outbound.lock().clone()
    }

    /// Simulate the remote peer's connection failing
    pub fn disconnect(&self) {
        let handler = self.closed_handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn set_remote_description(&self, offer: &SessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Handshake("session is closed".to_string()));
        }
        if offer.kind() != SdpKind::Offer {
            return Err(Error::Handshake("remote description is not an offer".to_string()));
        }

        let rtpmap = self.codec.rtpmap();
        let encoding = rtpmap.split_once(' ').map_or(rtpmap.as_str(), |(_, e)| e);
        if !offer.sdp().contains(encoding) {
            return Err(Error::Handshake(format!("offer does not support {encoding}")));
        }

        *self.remote.lock() = Some(offer.clone());
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote.lock().is_none() {
            return Err(Error::Handshake("no remote description".to_string()));
        }

        SessionDescription::answer(format!(
            "v=0\r\n\
             o=- 1 1 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF {pt}\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=mid:0\r\n\
             a=rtpmap:{rtpmap}\r\n",
            pt = self.codec.payload_type,
            rtpmap = self.codec.rtpmap(),
        ))
    }

    async fn gathering_complete(&self) -> GatheringComplete {
        let mut rx = self.gathered.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|done| *done).await;
        })
    }

    async fn set_local_description(&self, answer: &SessionDescription) -> Result<()> {
        *self.local.lock() = Some(answer.sdp().to_string());
        if !self.hold_gathering {
            self.complete_gathering();
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let mut sdp = self.local.lock().clone()?;
        if *self.gathered.borrow() {
            sdp.push_str(GATHERED_CANDIDATES);
        }
        SessionDescription::answer(sdp).ok()
    }

    fn on_inbound_track(&self, handler: InboundTrackHandler) {
        *self.inbound_handler.lock() = Some(Arc::new(handler));
    }

    fn on_closed(&self, handler: ClosedHandler) {
        *self.closed_handler.lock() = Some(Arc::new(handler));
    }

    async fn add_outbound_track(
        &self,
        _stream_id: &StreamId,
        _codec: &CodecProfile,
    ) -> Result<(Arc<dyn OutboundTrack>, Box<dyn FeedbackReader>)> {
        if self.is_closed() {
            return Err(Error::Setup("session is closed".to_string()));
        }

        let track = Arc::new(MemoryOutboundTrack::bound_to(self.closed.clone()));
        self.outbound.lock().push(Arc::clone(&track));

        Ok((
            track,
            Box::new(MemoryFeedbackReader {
                closed: self.closed.clone(),
            }),
        ))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

struct MemoryInboundTrack {
    mime_type: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RtpPacket>>,
}

#[async_trait]
impl InboundTrack for MemoryInboundTrack {
    fn ssrc(&self) -> u32 {
        0x1234_5678
    }

    fn mime_type(&self) -> String {
        self.mime_type.clone()
    }

    async fn read_rtp(&self) -> Result<RtpPacket> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("inbound track ended".to_string()))
    }
}

/// Outbound track recording every packet written to it
pub struct MemoryOutboundTrack {
    packets: Mutex<Vec<RtpPacket>>,
    written: watch::Sender<usize>,
    fail: AtomicBool,
    closed: CancellationToken,
}

impl Default for MemoryOutboundTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOutboundTrack {
    #[must_use]
    pub fn new() -> Self {
        Self::bound_to(CancellationToken::new())
    }

    fn bound_to(closed: CancellationToken) -> Self {
        let (written, _) = watch::channel(0);
        Self {
            packets: Mutex::new(Vec::new()),
            written,
            fail: AtomicBool::new(false),
            closed,
        }
    }

    #[must_use]
    pub fn packets(&self) -> Vec<RtpPacket> {
        self.packets.lock().clone()
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Wait until at least `count` packets were written
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.written.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|written| *written >= count)).await,
            Ok(Ok(_))
        );
        reached
    }
}

#[async_trait]
impl OutboundTrack for MemoryOutboundTrack {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) || self.closed.is_cancelled() {
            return Err(Error::Transport("outbound track closed".to_string()));
        }

        let mut packets = self.packets.lock();
        packets.push(packet.clone());
        self.written.send_replace(packets.len());
        Ok(())
    }
}

/// Feedback reader that idles until its session closes
struct MemoryFeedbackReader {
    closed: CancellationToken,
}

#[async_trait]
impl FeedbackReader for MemoryFeedbackReader {
    async fn read_rtcp(&mut self) -> Result<usize> {
        self.closed.cancelled().await;
        Err(Error::Transport("session closed".to_string()))
    }
}

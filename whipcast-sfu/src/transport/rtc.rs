//! `webrtc` crate implementation of the media transport

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::{
    ClosedHandler, FeedbackReader, GatheringComplete, InboundTrack, InboundTrackHandler,
    MediaTransport, OutboundTrack, RtpPacket, TransportSession,
};
use crate::config::{CodecProfile, RelayConfig};
use crate::error::{Error, Result};
use crate::types::{SessionDescription, SessionRole, StreamId};

/// Largest RTCP datagram read from a sender
const RTCP_READ_BUFFER: usize = 1500;

/// Media transport backed by `webrtc` peer connections
pub struct WebRtcTransport {
    ice_servers: Vec<String>,
    pli_interval: Duration,
}

impl WebRtcTransport {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        info!(
            ice_servers = ?config.ice_servers,
            pli_interval_ms = config.pli_interval_ms,
            "WebRTC transport initialized"
        );

        Self {
            ice_servers: config.ice_servers.clone(),
            pli_interval: config.pli_interval(),
        }
    }

    /// Build an API whose media engine knows exactly one video codec
    fn build_api(codec: &CodecProfile) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: codec_capability(codec),
                    payload_type: codec.payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| Error::Setup(format!("failed to register codec: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Setup(format!("failed to register interceptors: {e}")))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn new_session(
        &self,
        role: SessionRole,
        codec: &CodecProfile,
    ) -> Result<Arc<dyn TransportSession>> {
        let api = Self::build_api(codec)?;
        let pc = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| Error::Setup(format!("failed to create peer connection: {e}")))?;

        debug!(role = ?role, codec = %codec.mime_type, "Created peer connection");

        Ok(Arc::new(WebRtcSession {
            pc: Arc::new(pc),
            role,
            pli_interval: self.pli_interval,
            token: CancellationToken::new(),
        }))
    }
}

fn codec_capability(codec: &CodecProfile) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
        rtcp_feedback: vec![],
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    role: SessionRole,
    pli_interval: Duration,
    /// Stops the PLI tickers spawned for this session
    token: CancellationToken,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn set_remote_description(&self, offer: &SessionDescription) -> Result<()> {
        let description = RTCSessionDescription::offer(offer.sdp().to_string())
            .map_err(|e| Error::Handshake(format!("malformed offer: {e}")))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| Error::Handshake(format!("failed to set remote description: {e}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Handshake(format!("failed to create answer: {e}")))?;

        SessionDescription::answer(answer.sdp)
    }

    async fn gathering_complete(&self) -> GatheringComplete {
        let mut done = self.pc.gathering_complete_promise().await;
        Box::pin(async move {
            let _ = done.recv().await;
        })
    }

    async fn set_local_description(&self, answer: &SessionDescription) -> Result<()> {
        let description = RTCSessionDescription::answer(answer.sdp().to_string())
            .map_err(|e| Error::Handshake(format!("malformed answer: {e}")))?;

        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| Error::Handshake(format!("failed to set local description: {e}")))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        SessionDescription::answer(description.sdp).ok()
    }

    fn on_inbound_track(&self, handler: InboundTrackHandler) {
        let handler = Arc::new(handler);
        let pc = Arc::downgrade(&self.pc);
        let role = self.role;
        let pli_interval = self.pli_interval;
        let token = self.token.clone();

        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            info!(
                ssrc = track.ssrc(),
                codec = %track.codec().capability.mime_type,
                "Inbound track opened"
            );

            if role == SessionRole::Publish {
                spawn_pli_ticker(pc.clone(), track.ssrc(), pli_interval, token.clone());
            }
            handler(Box::new(WebRtcInboundTrack { track }));

            Box::pin(async {})
        }));
    }

    fn on_closed(&self, handler: ClosedHandler) {
        let handler = Arc::new(handler);

        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(state = %state, "Peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    handler();
                }
                Box::pin(async {})
            }));
    }

    async fn add_outbound_track(
        &self,
        stream_id: &StreamId,
        codec: &CodecProfile,
    ) -> Result<(Arc<dyn OutboundTrack>, Box<dyn FeedbackReader>)> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec_capability(codec),
            "video".to_string(),
            stream_id.to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::Setup(format!("failed to add video track: {e}")))?;

        Ok((
            Arc::new(WebRtcOutboundTrack { track }),
            Box::new(WebRtcFeedbackReader {
                sender,
                buf: vec![0u8; RTCP_READ_BUFFER],
            }),
        ))
    }

    async fn close(&self) {
        self.token.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Failed to close peer connection");
        }
    }
}

/// Periodically ask the publisher for a fresh keyframe so late subscribers
/// can start decoding
fn spawn_pli_ticker(
    pc: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    interval: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(pc) = pc.upgrade() else { break };
            if let Err(e) = pc
                .write_rtcp(&[Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                })])
                .await
            {
                warn!(ssrc = media_ssrc, error = %e, "Failed to send PLI");
                break;
            }
        }

        debug!(ssrc = media_ssrc, "PLI ticker stopped");
    });
}

struct WebRtcInboundTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRtcInboundTrack {
    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn mime_type(&self) -> String {
        self.track.codec().capability.mime_type
    }

    async fn read_rtp(&self) -> Result<RtpPacket> {
        let (packet, _attributes) = self.track.read_rtp().await?;
        Ok(packet)
    }
}

struct WebRtcOutboundTrack {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl OutboundTrack for WebRtcOutboundTrack {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()> {
        self.track.write_rtp(packet).await?;
        Ok(())
    }
}

struct WebRtcFeedbackReader {
    sender: Arc<RTCRtpSender>,
    buf: Vec<u8>,
}

#[async_trait]
impl FeedbackReader for WebRtcFeedbackReader {
    async fn read_rtcp(&mut self) -> Result<usize> {
        let (packets, _attributes) = self.sender.read(&mut self.buf).await?;
        Ok(packets.len())
    }
}

//! Signaling responder
//!
//! Drives the offer/answer exchange shared by publish and subscribe
//! sessions. Candidates are not trickled: the answer is only returned once
//! gathering has finished, so it carries the full candidate set.
//!
//! ```text
//! AwaitingRemote ──offer applied──► AwaitingGatherComplete ──gathered──► Complete
//! ```

use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::TransportSession;
use crate::types::SessionDescription;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingRemote,
    AwaitingGatherComplete,
    Complete,
}

/// Final answer of a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Canonical session resource path (`/whip/<id>` or `/whep/<id>`)
    pub location: String,
    /// Local description with every gathered candidate
    pub sdp: String,
}

/// Runs one handshake against one transport session
pub struct SignalingResponder<'a> {
    session: &'a dyn TransportSession,
    gather_timeout: Duration,
    state: HandshakeState,
}

impl<'a> SignalingResponder<'a> {
    #[must_use]
    pub fn new(session: &'a dyn TransportSession, gather_timeout: Duration) -> Self {
        Self {
            session,
            gather_timeout,
            state: HandshakeState::AwaitingRemote,
        }
    }

    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Apply `offer` and produce the complete answer.
    ///
    /// Suspends only the calling task until candidate gathering finishes or
    /// the gather timeout elapses.
    pub async fn respond(
        &mut self,
        offer: &SessionDescription,
        location: String,
    ) -> Result<Answer> {
        if self.state != HandshakeState::AwaitingRemote {
            return Err(Error::Handshake(format!(
                "handshake already in state {:?}",
                self.state
            )));
        }

        self.session.set_remote_description(offer).await?;
        self.state = HandshakeState::AwaitingGatherComplete;
        debug!(location = %location, "Remote description applied");

        // The signal must exist before the local description starts gathering
        let gathered = self.session.gathering_complete().await;
        let answer = self.session.create_answer().await?;
        self.session.set_local_description(&answer).await?;

        tokio::time::timeout(self.gather_timeout, gathered)
            .await
            .map_err(|_| Error::GatherTimeout(self.gather_timeout))?;

        let local = self
            .session
            .local_description()
            .await
            .ok_or_else(|| Error::Handshake("local description missing after gathering".to_string()))?;

        self.state = HandshakeState::Complete;
        debug!(location = %location, "Candidate gathering complete");

        Ok(Answer {
            location,
            sdp: local.into_sdp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecProfile;
    use crate::testing::{offer, MemoryTransport};
    use crate::transport::MediaTransport;
    use crate::types::SessionRole;

    #[tokio::test]
    async fn test_complete_handshake() {
        let transport = MemoryTransport::new();
        let session = transport
            .new_session(SessionRole::Publish, &CodecProfile::default())
            .await
            .unwrap();

        let mut responder = SignalingResponder::new(session.as_ref(), Duration::from_secs(1));
        assert_eq!(responder.state(), HandshakeState::AwaitingRemote);

        let answer = responder
            .respond(&offer(&CodecProfile::default()), "/whip/cam1".to_string())
            .await
            .unwrap();

        assert_eq!(responder.state(), HandshakeState::Complete);
        assert_eq!(answer.location, "/whip/cam1");
        assert!(answer.sdp.contains("a=rtpmap:96 H264/90000"));
        assert!(answer.sdp.contains("a=end-of-candidates"));
    }

    #[tokio::test]
    async fn test_waits_for_gathering() {
        let transport = MemoryTransport::new();
        transport.hold_gathering(true);
        let session = transport
            .new_session(SessionRole::Subscribe, &CodecProfile::default())
            .await
            .unwrap();
        let memory = transport.last_session().unwrap();

        let handshake = tokio::spawn({
            let session = session.clone();
            async move {
                SignalingResponder::new(session.as_ref(), Duration::from_secs(5))
                    .respond(&offer(&CodecProfile::default()), "/whep/cam1".to_string())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handshake.is_finished());
        assert!(memory.local_description_set());

        memory.complete_gathering();
        let answer = handshake.await.unwrap().unwrap();
        assert!(answer.sdp.contains("a=end-of-candidates"));
    }

    #[tokio::test]
    async fn test_gather_timeout() {
        let transport = MemoryTransport::new();
        transport.hold_gathering(true);
        let session = transport
            .new_session(SessionRole::Publish, &CodecProfile::default())
            .await
            .unwrap();

        let result = SignalingResponder::new(session.as_ref(), Duration::from_millis(50))
            .respond(&offer(&CodecProfile::default()), "/whip/cam1".to_string())
            .await;

        assert!(matches!(result, Err(Error::GatherTimeout(_))));
    }

    #[tokio::test]
    async fn test_incompatible_offer() {
        let transport = MemoryTransport::new();
        let session = transport
            .new_session(SessionRole::Publish, &CodecProfile::default())
            .await
            .unwrap();

        let vp8 = CodecProfile {
            mime_type: "video/VP8".to_string(),
            ..Default::default()
        };
        let mut responder = SignalingResponder::new(session.as_ref(), Duration::from_secs(1));
        let result = responder.respond(&offer(&vp8), "/whip/cam1".to_string()).await;

        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(responder.state(), HandshakeState::AwaitingRemote);
    }

    #[tokio::test]
    async fn test_responder_is_single_use() {
        let transport = MemoryTransport::new();
        let session = transport
            .new_session(SessionRole::Publish, &CodecProfile::default())
            .await
            .unwrap();

        let mut responder = SignalingResponder::new(session.as_ref(), Duration::from_secs(1));
        let codec = CodecProfile::default();
        responder.respond(&offer(&codec), "/whip/cam1".to_string()).await.unwrap();

        let again = responder.respond(&offer(&codec), "/whip/cam1".to_string()).await;
        assert!(matches!(again, Err(Error::Handshake(_))));
    }
}

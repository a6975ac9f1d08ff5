use std::time::Duration;

use thiserror::Error;

use crate::types::StreamId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Stream already exists: {0}")]
    Conflict(StreamId),

    #[error("Stream not found: {0}")]
    NotFound(StreamId),

    #[error("Invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Session setup failed: {0}")]
    Setup(String),

    #[error("Signaling handshake failed: {0}")]
    Handshake(String),

    #[error("Candidate gathering did not complete within {0:?}")]
    GatherTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

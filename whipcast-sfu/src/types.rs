//! Common types used throughout the relay

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Longest stream identifier accepted from a request path
pub const MAX_STREAM_ID_LEN: usize = 256;

/// Identifier of one logical stream, taken from the request path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct StreamId(String);

impl StreamId {
    /// Validate and wrap a stream identifier.
    ///
    /// Rejects empty identifiers, identifiers longer than
    /// [`MAX_STREAM_ID_LEN`], and anything containing `/` or control
    /// characters.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidStreamId("stream id must not be empty".to_string()));
        }
        if id.len() > MAX_STREAM_ID_LEN {
            return Err(Error::InvalidStreamId(format!(
                "stream id longer than {MAX_STREAM_ID_LEN} bytes"
            )));
        }
        if id.chars().any(|c| c == '/' || c.is_control()) {
            return Err(Error::InvalidStreamId(format!(
                "stream id contains forbidden characters: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for StreamId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for StreamId {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Unique identifier for one subscriber session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the relay a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// WHIP ingest session
    Publish,
    /// WHEP egress session
    Subscribe,
}

impl SessionRole {
    /// Path prefix of the resource a session of this role lives at
    #[must_use]
    pub const fn path_prefix(&self) -> &'static str {
        match self {
            Self::Publish => "/whip",
            Self::Subscribe => "/whep",
        }
    }

    /// Canonical resource location for a stream
    #[must_use]
    pub fn location(&self, id: &StreamId) -> String {
        format!("{}/{}", self.path_prefix(), id)
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// A session description with a checked kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    kind: SdpKind,
    sdp: String,
}

impl SessionDescription {
    /// Build an offer from a request body.
    ///
    /// Only the outer shape is checked here (version line and at least one
    /// media section); full parsing is left to the transport.
    pub fn offer(sdp: impl Into<String>) -> Result<Self> {
        Self::checked(SdpKind::Offer, sdp.into())
    }

    /// Build an answer produced by a transport session
    pub fn answer(sdp: impl Into<String>) -> Result<Self> {
        Self::checked(SdpKind::Answer, sdp.into())
    }

    fn checked(kind: SdpKind, sdp: String) -> Result<Self> {
        let trimmed = sdp.trim_start();
        if trimmed.is_empty() {
            return Err(Error::InvalidDescription(format!("empty {kind}")));
        }
        if !trimmed.starts_with("v=0") {
            return Err(Error::InvalidDescription(format!(
                "{kind} does not start with a v=0 line"
            )));
        }
        if !trimmed.lines().any(|line| line.starts_with("m=")) {
            return Err(Error::InvalidDescription(format!(
                "{kind} has no media section"
            )));
        }
        Ok(Self { kind, sdp })
    }

    #[must_use]
    pub const fn kind(&self) -> SdpKind {
        self.kind
    }

    #[must_use]
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    #[must_use]
    pub fn into_sdp(self) -> String {
        self.sdp
    }
}

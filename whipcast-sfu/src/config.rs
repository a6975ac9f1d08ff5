//! Relay configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// The single video codec every session is negotiated with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecProfile {
    /// MIME type (e.g. "video/H264")
    pub mime_type: String,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Audio channel count, always 0 for video
    pub channels: u16,
    /// Dynamic RTP payload type
    pub payload_type: u8,
    /// Extra format parameters for the `a=fmtp` line
    pub sdp_fmtp_line: String,
}

impl Default for CodecProfile {
    fn default() -> Self {
        Self {
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: 0,
            payload_type: 96,
            sdp_fmtp_line: String::new(),
        }
    }
}

impl CodecProfile {
    /// Check the profile can be registered with a transport
    pub fn validate(&self) -> Result<()> {
        let Some((kind, name)) = self.mime_type.split_once('/') else {
            return Err(Error::Setup(format!(
                "codec mime type {:?} is not of the form video/<name>",
                self.mime_type
            )));
        };
        if !kind.eq_ignore_ascii_case("video") || name.is_empty() {
            return Err(Error::Setup(format!(
                "codec mime type {:?} is not a video codec",
                self.mime_type
            )));
        }
        if self.clock_rate == 0 {
            return Err(Error::Setup("codec clock rate must be non-zero".to_string()));
        }
        if !(96..=127).contains(&self.payload_type) {
            return Err(Error::Setup(format!(
                "payload type {} is outside the dynamic range 96-127",
                self.payload_type
            )));
        }
        Ok(())
    }

    /// The `rtpmap` attribute value this profile produces, e.g. `96 H264/90000`
    #[must_use]
    pub fn rtpmap(&self) -> String {
        let name = self
            .mime_type
            .split_once('/')
            .map_or(self.mime_type.as_str(), |(_, name)| name);
        format!("{} {}/{}", self.payload_type, name, self.clock_rate)
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// STUN server URLs used for candidate gathering
    pub ice_servers: Vec<String>,
    /// Upper bound on candidate gathering before the handshake fails (ms)
    pub gather_timeout_ms: u64,
    /// Interval of picture-loss-indication feedback sent to publishers (ms)
    pub pli_interval_ms: u64,
    /// Capacity of the relay event channel
    pub event_capacity: usize,
    /// Video codec profile
    pub codec: CodecProfile,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            gather_timeout_ms: 10_000,
            pli_interval_ms: 3_000,
            event_capacity: 256,
            codec: CodecProfile::default(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    #[must_use]
    pub const fn pli_interval(&self) -> Duration {
        Duration::from_millis(self.pli_interval_ms)
    }

    /// Collect every problem with this configuration
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.codec.validate() {
            errors.push(e.to_string());
        }
        if self.gather_timeout_ms == 0 {
            errors.push("relay.gather_timeout_ms must be non-zero".to_string());
        }
        if self.pli_interval_ms == 0 {
            errors.push("relay.pli_interval_ms must be non-zero".to_string());
        }
        if self.event_capacity == 0 {
            errors.push("relay.event_capacity must be non-zero".to_string());
        }
        for url in &self.ice_servers {
            if !(url.starts_with("stun:") || url.starts_with("stuns:")) {
                errors.push(format!("relay.ice_servers entry {url:?} is not a STUN url"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

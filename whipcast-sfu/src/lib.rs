//! Whipcast relay core
//!
//! A single-process selective forwarding relay: one publisher per stream
//! ingests video over WHIP, and any number of subscribers receive the same
//! packets over WHEP.
//!
//! ## Architecture
//!
//! - **`StreamRegistry`**: Maps stream ids to their shared media source
//! - **`SharedMediaSource`**: Fans one publisher's packets out to subscribers
//! - **`PublishHandler`** / **`SubscribeHandler`**: Per-request session setup
//! - **`SignalingResponder`**: Offer/answer exchange, complete after gathering
//! - **`MediaTransport`**: Seam to the real-time media stack (`webrtc` crate)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use whipcast_sfu::{Relay, RelayConfig, SessionDescription, StreamId};
//!
//! let relay = Relay::with_webrtc(RelayConfig::default());
//! let answer = relay
//!     .publish(StreamId::parse("cam1")?, SessionDescription::offer(body)?)
//!     .await?;
//! assert_eq!(answer.location, "/whip/cam1");
//! ```

mod config;
mod error;
mod events;
mod publisher;
mod registry;
mod relay;
mod signaling;
mod source;
mod subscriber;
pub mod transport;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{CodecProfile, RelayConfig};
pub use error::{Error, Result};
pub use events::{EndReason, EventBus, RelayEvent};
pub use publisher::PublishHandler;
pub use registry::StreamRegistry;
pub use relay::Relay;
pub use signaling::{Answer, HandshakeState, SignalingResponder};
pub use source::{SharedMediaSource, StreamInfo};
pub use subscriber::SubscribeHandler;
pub use types::{SdpKind, SessionDescription, SessionRole, StreamId, SubscriberId, MAX_STREAM_ID_LEN};

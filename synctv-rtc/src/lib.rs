//! `SyncTV` RTC session core
//!
//! Negotiates and maintains one real-time media connection per remote peer
//! of a watch-together room, and keeps each connection's outbound stream
//! profile matched to what the network can carry.
//!
//! ## Architecture
//!
//! - **`SessionRegistry`**: owns every peer connection of one room session
//! - **`Connection`**: per-peer negotiation state machine
//! - **`RetryController`**: exponential backoff with jitter for reconnection
//! - **`StatsSampler`**: turns raw transport statistics into quality samples
//! - **`AdaptationEngine`**: walks the stream profile ladder with dwell and
//!   anti-flap limits
//! - **`EventBus`**: typed notifications for the rest of the application
//!
//! The media engine and the signaling relay are external; they plug in
//! through [`MediaTransport`] and [`SignalingChannel`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_rtc::{PeerId, RoomId, RtcConfig, SessionRegistry};
//!
//! let config = RtcConfig::load(Some("rtc.toml"))?;
//! let registry = SessionRegistry::new(
//!     RoomId::from("room_id"),
//!     PeerId::from("local_user"),
//!     config,
//!     transport,
//!     signaling,
//! )?;
//!
//! let mut events = registry.subscribe();
//! registry.open_connection(PeerId::from("remote_user")).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod quality;
pub mod registry;
pub mod retry;
pub mod sampler;
pub mod signaling;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::RtcConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, SessionEvent};
pub use quality::{
    AdaptationEngine, DecisionReason, EncodingParameters, ProfileLadder, QualityDecision,
    QualityLabel, QualitySample, QualityScore, StreamProfile,
};
pub use registry::SessionRegistry;
pub use signaling::{SignalingChannel, SignalingMessage};
pub use transport::{
    IceCandidate, MediaTransport, RawStatsSnapshot, SdpType, SessionDescription, StatsReport,
    StatsReportKind, TransportEvent, TransportHandle,
};
pub use types::{PeerId, RoomId};

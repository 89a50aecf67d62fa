//! Media transport capability
//!
//! The session core drives an external transport engine (a native WebRTC
//! stack, for instance) through [`MediaTransport`]. Descriptions and
//! candidates are passed through opaquely; only statistics are interpreted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::quality::EncodingParameters;
use crate::types::PeerId;
use crate::Result;

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Opaque handle to one transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Asynchronous connection-state reports from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Failed(String),
    /// The transport closed the session without being asked to
    Closed,
    RemoteMediaAvailable,
}

/// One report of a raw statistics snapshot
///
/// Snapshots may carry several reports with the same `id` (duplicates from
/// different collection passes) and partial reports missing some fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub id: String,
    /// Collection time in milliseconds, transport clock
    pub timestamp_ms: f64,
    pub kind: StatsReportKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatsReportKind {
    /// Local outbound RTP stream (cumulative counters)
    OutboundRtp { bytes_sent: u64, packets_sent: u64 },
    /// The remote's view of our outbound stream
    RemoteInboundRtp {
        round_trip_time_ms: Option<f64>,
        jitter_ms: Option<f64>,
        packets_lost: Option<u64>,
        fraction_lost: Option<f64>,
    },
    /// ICE candidate pair
    CandidatePair {
        nominated: bool,
        current_round_trip_time_ms: Option<f64>,
        available_outgoing_bitrate_bps: Option<f64>,
    },
}

/// Everything `get_stats` returned for one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStatsSnapshot {
    pub reports: Vec<StatsReport>,
}

/// Media transport engine driven by the session core
///
/// Only `get_stats` may suspend; the other operations are expected to
/// complete synchronously. Connection-state changes are reported back through
/// [`crate::SessionRegistry::handle_transport_event`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn create_session(&self, peer_id: &PeerId) -> Result<TransportHandle>;

    fn create_offer(&self, handle: TransportHandle) -> Result<SessionDescription>;

    fn create_answer(&self, handle: TransportHandle) -> Result<SessionDescription>;

    fn set_local_description(
        &self,
        handle: TransportHandle,
        description: &SessionDescription,
    ) -> Result<()>;

    fn set_remote_description(
        &self,
        handle: TransportHandle,
        description: &SessionDescription,
    ) -> Result<()>;

    fn add_candidate(&self, handle: TransportHandle, candidate: &IceCandidate) -> Result<()>;

    async fn get_stats(&self, handle: TransportHandle) -> Result<RawStatsSnapshot>;

    fn set_encoding_parameters(
        &self,
        handle: TransportHandle,
        parameters: &EncodingParameters,
    ) -> Result<()>;

    /// Release every resource held for the session
    fn close(&self, handle: TransportHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_type() {
        assert_eq!(SdpType::Offer.as_str(), "offer");
        assert_eq!(SessionDescription::answer("v=0").sdp_type, SdpType::Answer);
    }

    #[test]
    fn test_session_description_serialization() {
        let desc = SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n");

        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"sdp_type\":\"offer\""));
        let deserialized: SessionDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, desc);
    }

    #[test]
    fn test_stats_report_deserialization() {
        let json = r#"{
            "id": "RIA1",
            "timestamp_ms": 1000.0,
            "kind": {
                "type": "remote-inbound-rtp",
                "round_trip_time_ms": 42.0,
                "jitter_ms": null,
                "packets_lost": 3,
                "fraction_lost": 0.01
            }
        }"#;

        let report: StatsReport = serde_json::from_str(json).unwrap();
        match report.kind {
            StatsReportKind::RemoteInboundRtp {
                round_trip_time_ms,
                jitter_ms,
                ..
            } => {
                assert_eq!(round_trip_time_ms, Some(42.0));
                assert_eq!(jitter_ms, None);
            }
            other => panic!("unexpected report kind: {other:?}"),
        }
    }
}

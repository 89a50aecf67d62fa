//! Signaling channel capability
//!
//! Carries offer/answer/candidate messages between this participant and the
//! remote peers of one room.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::transport::{IceCandidate, SessionDescription};
use crate::types::{PeerId, RoomId};
use crate::Result;

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Offer to establish (or renegotiate) a connection
    Offer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    /// Answer to an offer
    Answer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    /// ICE candidate for connection establishment
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. } => room_id,
        }
    }

    /// Wrap a local description in the matching message variant
    #[must_use]
    pub fn description(room_id: RoomId, sdp: SessionDescription) -> Self {
        match sdp.sdp_type {
            crate::transport::SdpType::Offer => Self::Offer { room_id, sdp },
            crate::transport::SdpType::Answer => Self::Answer { room_id, sdp },
        }
    }
}

/// Outbound half of the signaling channel. Inbound messages are delivered to
/// [`crate::SessionRegistry::handle_signaling_message`] keyed by sender.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, peer_id: &PeerId, message: SignalingMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_wraps_by_type() {
        let room = RoomId::from("room1");
        let offer = SignalingMessage::description(room.clone(), SessionDescription::offer("o"));
        assert!(matches!(offer, SignalingMessage::Offer { .. }));

        let answer = SignalingMessage::description(room.clone(), SessionDescription::answer("a"));
        assert!(matches!(answer, SignalingMessage::Answer { .. }));
        assert_eq!(answer.room_id(), &room);
    }

    #[test]
    fn test_message_serialization() {
        let message = SignalingMessage::IceCandidate {
            room_id: RoomId::from("room1"),
            candidate: IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host"),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "ice_candidate");
        assert_eq!(json["room_id"], "room1");

        let back: SignalingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}

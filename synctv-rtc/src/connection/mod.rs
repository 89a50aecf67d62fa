//! Per-peer connection record and state machine
//!
//! ```text
//! New ─► Offering ─► AwaitingAnswer ─► Connecting ─► Connected
//!  │                                      ▲ │            │
//!  └──────────── remote offer ────────────┘ └─► Failed ◄─┤
//!                                               │  ▲     ▼
//!                 Offering ◄── Reconnecting ◄───┘  └─ Reconnecting
//! ```
//!
//! `Connecting` and `Reconnecting` may loop on ICE restart. `Closed` is
//! reachable from every other state and is terminal: transitions out of it
//! are silently ignored.

mod candidates;

pub use candidates::CandidateBuffer;

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

use crate::quality::QualitySample;
use crate::transport::{IceCandidate, TransportHandle};
use crate::types::PeerId;
use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Offering,
    AwaitingAnswer,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            AwaitingAnswer, Closed, Connected, Connecting, Failed, New, Offering, Reconnecting,
        };

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Offering | Connecting)
            | (Offering, AwaitingAnswer | Failed)
            | (AwaitingAnswer, Connecting | Failed)
            | (Connecting, Connecting | Connected | Failed)
            | (Connected, Reconnecting | Failed)
            | (Reconnecting, Reconnecting | Offering | Connected | Failed)
            | (Failed, Reconnecting) => true,
            _ => false,
        }
    }

    /// States bounded by the establishment timeout
    #[must_use]
    pub const fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::Offering | Self::AwaitingAnswer | Self::Connecting | Self::Reconnecting
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Offering => "offering",
            Self::AwaitingAnswer => "awaiting_answer",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation state for one remote peer
#[derive(Debug)]
pub struct Connection {
    peer_id: PeerId,
    state: ConnectionState,
    created_at: Instant,
    last_transition_at: Instant,
    attempts: u32,
    local_description_set: bool,
    remote_description_set: bool,
    candidates: CandidateBuffer,
    last_sample: Option<QualitySample>,
    handle: Option<TransportHandle>,
    /// Bumped whenever a negotiation attempt starts, so stale timers can tell
    epoch: u64,
}

impl Connection {
    #[must_use]
    pub fn new(peer_id: PeerId, max_buffered_candidates: usize) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            state: ConnectionState::New,
            created_at: now,
            last_transition_at: now,
            attempts: 0,
            local_description_set: false,
            remote_description_set: false,
            candidates: CandidateBuffer::new(max_buffered_candidates),
            last_sample: None,
            handle: None,
            epoch: 0,
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub const fn last_transition_at(&self) -> Instant {
        self.last_transition_at
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    #[must_use]
    pub const fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    #[must_use]
    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub const fn last_sample(&self) -> Option<&QualitySample> {
        self.last_sample.as_ref()
    }

    #[must_use]
    pub const fn handle(&self) -> Option<TransportHandle> {
        self.handle
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Move to `next`
    ///
    /// Returns the previous state, or `None` when the connection is already
    /// closed (close wins over any concurrent transition). Edges outside the
    /// state machine are a signaling error and leave the state unchanged.
    pub fn transition(&mut self, next: ConnectionState) -> Result<Option<ConnectionState>> {
        if self.state == ConnectionState::Closed {
            return Ok(None);
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::Signaling(format!(
                "peer {}: illegal transition {} -> {}",
                self.peer_id, self.state, next
            )));
        }

        let previous = self.state;
        self.state = next;
        self.last_transition_at = Instant::now();
        Ok(Some(previous))
    }

    /// Start a new negotiation attempt and return its epoch
    pub fn begin_attempt(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Count one reconnection attempt; never exceeds `max_attempts`
    pub fn record_attempt(&mut self, max_attempts: u32) -> bool {
        if self.attempts >= max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attach(&mut self, handle: TransportHandle) {
        self.handle = Some(handle);
    }

    /// Forget the transport session and every description negotiated on it
    pub fn detach(&mut self) -> Option<TransportHandle> {
        self.local_description_set = false;
        self.remote_description_set = false;
        self.candidates.clear();
        self.handle.take()
    }

    pub fn mark_local_description_set(&mut self) {
        self.local_description_set = true;
    }

    /// Record the remote description and hand back the candidates that were
    /// waiting for it, in arrival order
    pub fn mark_remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.candidates.drain()
    }

    /// Buffer a candidate received ahead of the remote description.
    /// Returns how many older candidates were evicted.
    pub fn buffer_candidate(&mut self, candidate: IceCandidate) -> usize {
        self.candidates.push(candidate)
    }

    pub fn record_sample(&mut self, sample: QualitySample) {
        self.last_sample = Some(sample);
    }
}

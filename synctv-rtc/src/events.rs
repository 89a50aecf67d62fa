//! Session event bus
//!
//! Typed notifications for UI, chat, recording and moderation collaborators.
//! Events for one peer are delivered in the order they were published; no
//! ordering is promised across peers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::error::ErrorKind;
use crate::types::PeerId;

/// Everything the session core announces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    ConnectionStateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
    ConnectionEstablished {
        peer_id: PeerId,
    },
    ConnectionClosed {
        peer_id: PeerId,
    },
    RemoteMediaAvailable {
        peer_id: PeerId,
    },
    QualitySampled {
        peer_id: PeerId,
        bitrate_kbps: f64,
        rtt_ms: f64,
        jitter_ms: f64,
        loss: f64,
        bandwidth_kbps: Option<f64>,
    },
    QualityAdapted {
        peer_id: PeerId,
        previous: String,
        new: String,
        reason: u16,
        confidence: f64,
    },
    /// Early candidates were discarded because the buffer was full
    CandidatesDropped {
        peer_id: PeerId,
        dropped: usize,
    },
    ConnectionError {
        peer_id: PeerId,
        kind: ErrorKind,
        detail: String,
    },
}

impl SessionEvent {
    /// Topic name, matching the serialized `type` tag
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection-state-changed",
            Self::ConnectionEstablished { .. } => "connection-established",
            Self::ConnectionClosed { .. } => "connection-closed",
            Self::RemoteMediaAvailable { .. } => "remote-media-available",
            Self::QualitySampled { .. } => "quality-sampled",
            Self::QualityAdapted { .. } => "quality-adapted",
            Self::CandidatesDropped { .. } => "candidates-dropped",
            Self::ConnectionError { .. } => "connection-error",
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::ConnectionStateChanged { peer_id, .. }
            | Self::ConnectionEstablished { peer_id }
            | Self::ConnectionClosed { peer_id }
            | Self::RemoteMediaAvailable { peer_id }
            | Self::QualitySampled { peer_id, .. }
            | Self::QualityAdapted { peer_id, .. }
            | Self::CandidatesDropped { peer_id, .. }
            | Self::ConnectionError { peer_id, .. } => peer_id,
        }
    }
}

/// Broadcast channel carrying [`SessionEvent`]s to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(topic = event.topic(), "No event subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Total events published since creation
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

//! Network quality scoring and stream adaptation
//!
//! ## Quality labels
//! - Excellent: RTT and loss below the excellent ceilings
//! - Good: within the good ceilings
//! - Poor: above the good ceilings but below critical
//! - Critical: RTT or loss above the critical ceilings
//!
//! The worse of RTT and loss always dominates the label.

mod engine;
mod profile;
mod scorer;

pub use engine::{AdaptationEngine, DecisionReason, QualityDecision};
pub use profile::{EncodingParameters, ProfileLadder, StreamProfile};
pub use scorer::{classify, score};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// One normalized statistics observation for a connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub at: Instant,
    /// Observed outbound media bitrate
    pub bitrate_kbps: f64,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Packet loss fraction (0.0 - 1.0)
    pub loss: f64,
    /// Available bandwidth estimate, when the transport has reported one
    pub bandwidth_kbps: Option<f64>,
}

/// Categorical quality label
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Critical,
    Poor,
    Good,
    Excellent,
}

impl QualityLabel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Poor => "poor",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }
}

/// Label plus how strongly the recent window agrees with it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityScore {
    pub label: QualityLabel,
    /// 0.0 - 1.0
    pub confidence: f64,
}

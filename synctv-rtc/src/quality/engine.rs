//! Stream adaptation decisions
//!
//! The engine walks the profile ladder from the current tier:
//! - margin-adjusted bandwidth below the tier's minimum: drop to the highest
//!   tier the bandwidth still satisfies
//! - latest sample labelled critical: drop one tier
//! - bandwidth comfortably above the tier's ceiling with a run of excellent
//!   samples within the target latency: climb one tier
//!
//! Without a bandwidth estimate from the transport only the critical rule
//! applies.
//!
//! Automatic decisions are rate limited by a minimum dwell interval and a
//! cap on decisions within a trailing window, so adjacent tiers don't flap.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::profile::{EncodingParameters, ProfileLadder, StreamProfile};
use super::scorer::{classify, score};
use super::{QualityLabel, QualitySample};
use crate::config::{AdaptationConfig, QualityThresholds};
use crate::{Error, Result};

/// Why a decision was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum DecisionReason {
    BandwidthLimited = 1,
    CriticalQuality = 2,
    HeadroomAvailable = 3,
    ManualOverride = 4,
}

impl DecisionReason {
    /// Numeric reason code
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// A change of stream profile for one connection. Never mutated once built.
#[derive(Debug, Clone)]
pub struct QualityDecision {
    pub at: Instant,
    pub previous: Arc<StreamProfile>,
    pub new: Arc<StreamProfile>,
    pub reason: DecisionReason,
    /// 0.0 - 1.0
    pub confidence: f64,
    tier: usize,
}

/// Per-connection adaptation state
pub struct AdaptationEngine {
    ladder: Arc<ProfileLadder>,
    config: AdaptationConfig,
    thresholds: QualityThresholds,
    min_tier: usize,
    max_tier: usize,
    current: usize,
    last_decision_at: Option<Instant>,
    /// Timestamps of recent decisions, for the flap window
    recent_decisions: VecDeque<Instant>,
    history: VecDeque<QualityDecision>,
    override_active: bool,
    /// RTT ceiling for stepping up
    target_latency_ms: Option<f64>,
}

impl AdaptationEngine {
    pub fn new(
        ladder: Arc<ProfileLadder>,
        config: &AdaptationConfig,
        thresholds: &QualityThresholds,
    ) -> Result<Self> {
        let tier = |name: &str| {
            ladder
                .index_of(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown stream tier: {name}")))
        };
        let min_tier = tier(&config.min_tier)?;
        let max_tier = tier(&config.max_tier)?;
        let current = tier(&config.initial_tier)?.clamp(min_tier, max_tier.max(min_tier));

        Ok(Self {
            ladder,
            config: config.clone(),
            thresholds: thresholds.clone(),
            min_tier,
            max_tier,
            current,
            last_decision_at: None,
            recent_decisions: VecDeque::new(),
            history: VecDeque::new(),
            override_active: false,
            target_latency_ms: None,
        })
    }

    /// Only step up while RTT stays within `target`
    #[must_use]
    pub fn with_target_latency(mut self, target: Duration) -> Self {
        self.target_latency_ms = Some(target.as_secs_f64() * 1000.0);
        self
    }

    #[must_use]
    pub fn current_profile(&self) -> Arc<StreamProfile> {
        self.profile(self.current)
    }

    #[must_use]
    pub fn history(&self) -> Vec<QualityDecision> {
        self.history.iter().cloned().collect()
    }

    #[must_use]
    pub const fn override_active(&self) -> bool {
        self.override_active
    }

    /// Encoder limits a decision asks the transport to apply
    #[must_use]
    pub fn encoding_parameters(&self, decision: &QualityDecision) -> Option<EncodingParameters> {
        self.ladder.encoding_parameters(decision.tier)
    }

    /// Propose an automatic decision for the latest samples, if one is due
    #[must_use]
    pub fn evaluate(&self, now: Instant, samples: &[QualitySample]) -> Option<QualityDecision> {
        if self.override_active && self.config.sticky_override {
            return None;
        }

        let window = &samples[samples.len().saturating_sub(self.config.window_size)..];
        let latest = window.last()?;

        let available = self.available_bandwidth(window);
        let current = self.profile(self.current);
        let scored = score(latest, window, &self.thresholds);

        let (target, reason) = match available {
            Some(available) if available < f64::from(current.min_bitrate_kbps) => {
                let target = (self.min_tier..self.current)
                    .rev()
                    .find(|&i| f64::from(self.profile(i).min_bitrate_kbps) <= available)
                    .unwrap_or(self.min_tier);
                (target, DecisionReason::BandwidthLimited)
            }
            _ if scored.label == QualityLabel::Critical && self.current > self.min_tier => {
                (self.current - 1, DecisionReason::CriticalQuality)
            }
            Some(available)
                if self.current < self.max_tier
                    && available
                        >= f64::from(current.max_bitrate_kbps) * self.config.upgrade_margin
                    && self.recently_excellent(window) =>
            {
                (self.current + 1, DecisionReason::HeadroomAvailable)
            }
            _ => return None,
        };

        if target == self.current {
            return None;
        }

        if !self.dwell_elapsed(now) {
            debug!(
                from = %current.name,
                to = %self.profile(target).name,
                ?reason,
                "Adaptation suppressed by dwell window"
            );
            return None;
        }

        Some(self.decision(now, target, reason, scored.confidence))
    }

    /// Build a manual override decision; it bypasses the dwell window
    pub fn override_decision(&self, now: Instant, tier_name: &str) -> Result<QualityDecision> {
        let target = self
            .ladder
            .index_of(tier_name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown stream tier: {tier_name}")))?;

        if target < self.min_tier || target > self.max_tier {
            return Err(Error::InvalidInput(format!(
                "stream tier {tier_name} is outside the session bounds {}..={}",
                self.profile(self.min_tier).name,
                self.profile(self.max_tier).name,
            )));
        }

        Ok(self.decision(now, target, DecisionReason::ManualOverride, 1.0))
    }

    /// Record a decision the transport accepted
    pub fn commit(&mut self, decision: QualityDecision) {
        self.current = decision.tier;
        self.last_decision_at = Some(decision.at);

        self.recent_decisions.push_back(decision.at);
        while let Some(&at) = self.recent_decisions.front() {
            if decision.at.duration_since(at) >= self.config.flap_window() {
                self.recent_decisions.pop_front();
            } else {
                break;
            }
        }

        if decision.reason == DecisionReason::ManualOverride {
            self.override_active = true;
        }

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(decision);
    }

    /// Let automatic adaptation resume after a sticky override
    pub fn clear_override(&mut self) {
        self.override_active = false;
    }

    fn dwell_elapsed(&self, now: Instant) -> bool {
        if let Some(last) = self.last_decision_at {
            if now.duration_since(last) < self.config.min_dwell() {
                return false;
            }
        }

        let in_window = self
            .recent_decisions
            .iter()
            .filter(|&&at| now.duration_since(at) < self.config.flap_window())
            .count();
        in_window < self.config.max_decisions_per_window
    }

    /// `min(mean, latest) * safety_margin` over the samples carrying an
    /// estimate. `None` unless the latest sample has one.
    fn available_bandwidth(&self, window: &[QualitySample]) -> Option<f64> {
        let latest = window.last()?.bandwidth_kbps?;
        let estimates: Vec<f64> = window.iter().filter_map(|s| s.bandwidth_kbps).collect();
        let mean = estimates.iter().sum::<f64>() / estimates.len() as f64;
        Some(mean.min(latest) * self.config.bandwidth_safety_margin)
    }

    fn recently_excellent(&self, window: &[QualitySample]) -> bool {
        let needed = self.config.upgrade_stable_samples.max(1);
        window.len() >= needed
            && window[window.len() - needed..].iter().all(|s| {
                classify(s, &self.thresholds) == QualityLabel::Excellent
                    && self.target_latency_ms.map_or(true, |target| s.rtt_ms <= target)
            })
    }

    fn decision(
        &self,
        at: Instant,
        target: usize,
        reason: DecisionReason,
        confidence: f64,
    ) -> QualityDecision {
        QualityDecision {
            at,
            previous: self.profile(self.current),
            new: self.profile(target),
            reason,
            confidence: confidence.clamp(0.0, 1.0),
            tier: target,
        }
    }

    fn profile(&self, index: usize) -> Arc<StreamProfile> {
        // Indices are resolved against this ladder in `new`/`override_decision`
        Arc::clone(&self.ladder.tiers()[index])
    }
}

//! Quality scoring
//!
//! Pure functions of a sample and its recent window, so scoring can be
//! exercised without any transport.

use super::{QualityLabel, QualitySample, QualityScore};
use crate::config::QualityThresholds;

/// Label a single sample. The worse of RTT and loss dominates.
#[must_use]
pub fn classify(sample: &QualitySample, thresholds: &QualityThresholds) -> QualityLabel {
    let rtt = sample.rtt_ms;
    let loss = sample.loss;

    if rtt > thresholds.critical_rtt_ms || loss > thresholds.critical_loss {
        QualityLabel::Critical
    } else if rtt > thresholds.good_rtt_ms || loss > thresholds.good_loss {
        QualityLabel::Poor
    } else if rtt > thresholds.excellent_rtt_ms || loss > thresholds.excellent_loss {
        QualityLabel::Good
    } else {
        QualityLabel::Excellent
    }
}

/// Label `sample` and rate the confidence by how much of `window` agrees
///
/// Confidence is `0.5 + 0.5 * agreement`, where agreement is the fraction of
/// window samples carrying the same label. An empty window yields 0.5.
#[must_use]
pub fn score(
    sample: &QualitySample,
    window: &[QualitySample],
    thresholds: &QualityThresholds,
) -> QualityScore {
    let label = classify(sample, thresholds);

    let confidence = if window.is_empty() {
        0.5
    } else {
        let agreeing = window
            .iter()
            .filter(|s| classify(s, thresholds) == label)
            .count();
        0.5 + 0.5 * (agreeing as f64 / window.len() as f64)
    };

    QualityScore { label, confidence }
}

//! Transport statistics sampling
//!
//! Turns raw transport snapshots into [`QualitySample`]s and keeps the most
//! recent ones in a bounded ring buffer. The polling task itself is driven
//! by the registry; the sampler only owns its cancellation token.

use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SamplerConfig;
use crate::quality::QualitySample;
use crate::transport::{RawStatsSnapshot, StatsReport, StatsReportKind};

/// Cumulative counters carried between ticks
#[derive(Debug, Clone, Copy)]
struct Counters {
    timestamp_ms: f64,
    bytes_sent: u64,
    packets_sent: u64,
    packets_lost: Option<u64>,
}

/// Per-connection sample history and normalisation state
#[derive(Debug)]
pub struct StatsSampler {
    history: VecDeque<QualitySample>,
    capacity: usize,
    previous: Option<Counters>,
    running: Option<CancellationToken>,
}

impl StatsSampler {
    #[must_use]
    pub fn new(config: &SamplerConfig) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            previous: None,
            running: None,
        }
    }

    /// Begin a sampling run under `parent`, replacing any previous run.
    /// Returns the token the polling task must watch.
    pub fn start(&mut self, parent: &CancellationToken) -> CancellationToken {
        self.stop();
        let token = parent.child_token();
        self.running = Some(token.clone());
        token
    }

    /// Stop sampling. Counters are dropped because the next run may be on a
    /// different transport session.
    pub fn stop(&mut self) {
        if let Some(token) = self.running.take() {
            token.cancel();
        }
        self.previous = None;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Resolve a snapshot into a single sample
    ///
    /// Duplicate reports keep the newest by timestamp. Fields missing from
    /// every report carry over from the previous sample; the bandwidth
    /// estimate stays `None` until the transport reports one.
    pub fn normalize(&mut self, now: Instant, snapshot: &RawStatsSnapshot) -> QualitySample {
        let reports = dedupe(&snapshot.reports);
        let last = self.history.back().copied();

        let mut counters = Counters {
            timestamp_ms: 0.0,
            bytes_sent: 0,
            packets_sent: 0,
            packets_lost: None,
        };
        let mut has_outbound = false;
        let mut nominated_rtt = None;
        let mut available_bps = None;
        let mut remote_rtts = Vec::new();
        let mut worst_jitter: Option<f64> = None;
        let mut fractions = Vec::new();

        for report in reports {
            match &report.kind {
                StatsReportKind::OutboundRtp {
                    bytes_sent,
                    packets_sent,
                } => {
                    has_outbound = true;
                    counters.timestamp_ms = counters.timestamp_ms.max(report.timestamp_ms);
                    counters.bytes_sent += bytes_sent;
                    counters.packets_sent += packets_sent;
                }
                StatsReportKind::RemoteInboundRtp {
                    round_trip_time_ms,
                    jitter_ms,
                    packets_lost,
                    fraction_lost,
                } => {
                    remote_rtts.extend(*round_trip_time_ms);
                    if let Some(jitter) = jitter_ms {
                        worst_jitter = Some(worst_jitter.map_or(*jitter, |w| w.max(*jitter)));
                    }
                    if let Some(lost) = packets_lost {
                        *counters.packets_lost.get_or_insert(0) += lost;
                    }
                    fractions.extend(*fraction_lost);
                }
                StatsReportKind::CandidatePair {
                    nominated,
                    current_round_trip_time_ms,
                    available_outgoing_bitrate_bps,
                } => {
                    if *nominated {
                        nominated_rtt = nominated_rtt.or(*current_round_trip_time_ms);
                        available_bps = available_bps.or(*available_outgoing_bitrate_bps);
                    }
                }
            }
        }

        let previous = self.previous;
        let bitrate_kbps = match previous {
            Some(prev) if has_outbound => {
                let elapsed_ms = counters.timestamp_ms - prev.timestamp_ms;
                if elapsed_ms > 0.0 && counters.bytes_sent >= prev.bytes_sent {
                    // bits per millisecond is kilobits per second
                    (counters.bytes_sent - prev.bytes_sent) as f64 * 8.0 / elapsed_ms
                } else {
                    0.0
                }
            }
            _ => last.map_or(0.0, |s| s.bitrate_kbps),
        };

        let rtt_ms = nominated_rtt
            .or_else(|| mean(&remote_rtts))
            .or_else(|| last.map(|s| s.rtt_ms))
            .unwrap_or(0.0);

        let jitter_ms = worst_jitter
            .or_else(|| last.map(|s| s.jitter_ms))
            .unwrap_or(0.0);

        let loss = packet_loss(previous, &counters)
            .or_else(|| mean(&fractions))
            .or_else(|| last.map(|s| s.loss))
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        // Only the transport's own estimate counts. Our send rate is capped by
        // the current profile, so it says nothing about spare capacity.
        let bandwidth_kbps = available_bps
            .map(|bps| bps / 1000.0)
            .or_else(|| last.and_then(|s| s.bandwidth_kbps));

        if has_outbound {
            self.previous = Some(counters);
        }

        // Samples stay timestamp ordered even if the caller's clock stalls
        let at = last.map_or(now, |s| s.at.max(now));

        QualitySample {
            at,
            bitrate_kbps,
            rtt_ms,
            jitter_ms,
            loss,
            bandwidth_kbps,
        }
    }

    /// Append a sample, evicting the oldest when full
    pub fn record(&mut self, sample: QualitySample) {
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    /// Recorded samples, oldest first
    #[must_use]
    pub fn samples(&self) -> Vec<QualitySample> {
        self.history.iter().copied().collect()
    }

    /// Recorded samples as one slice, oldest first
    pub fn window(&mut self) -> &[QualitySample] {
        self.history.make_contiguous()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

fn dedupe(reports: &[StatsReport]) -> Vec<&StatsReport> {
    let mut newest: HashMap<&str, &StatsReport> = HashMap::new();
    let mut order = Vec::new();
    for report in reports {
        match newest.get_mut(report.id.as_str()) {
            Some(kept) => {
                if report.timestamp_ms > kept.timestamp_ms {
                    *kept = report;
                }
            }
            None => {
                newest.insert(report.id.as_str(), report);
                order.push(report.id.as_str());
            }
        }
    }
    order.into_iter().filter_map(|id| newest.get(id).copied()).collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Loss over the packets sent since the previous tick
fn packet_loss(previous: Option<Counters>, current: &Counters) -> Option<f64> {
    let prev = previous?;
    let lost_now = current.packets_lost?;
    let lost_before = prev.packets_lost.unwrap_or(0);
    let sent = current.packets_sent.checked_sub(prev.packets_sent)?;
    if sent == 0 {
        return None;
    }
    let lost = lost_now.saturating_sub(lost_before);
    Some(lost as f64 / sent as f64)
}

//! Test helpers and fixtures for synctv-rtc tests
//!
//! In-memory transport and signaling doubles that record every call, plus
//! builders for statistics snapshots.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::RtcConfig;
use crate::quality::EncodingParameters;
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::transport::{
    IceCandidate, MediaTransport, RawStatsSnapshot, SessionDescription, StatsReport,
    StatsReportKind, TransportHandle,
};
use crate::types::{PeerId, RoomId};
use crate::{Error, Result, SessionRegistry};

#[derive(Default)]
struct TransportLog {
    next_handle: u64,
    created: Vec<TransportHandle>,
    closed: Vec<TransportHandle>,
    candidates: Vec<String>,
    encodings: Vec<EncodingParameters>,
    stats: VecDeque<RawStatsSnapshot>,
    reject_encoding: bool,
}

/// Media transport double. Stats snapshots are served in queue order and
/// the last one repeats.
#[derive(Default)]
pub struct FakeTransport {
    log: Mutex<TransportLog>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_stats(&self, snapshot: RawStatsSnapshot) {
        self.log.lock().stats.push_back(snapshot);
    }

    pub fn reject_encoding(&self, reject: bool) {
        self.log.lock().reject_encoding = reject;
    }

    pub fn created(&self) -> Vec<TransportHandle> {
        self.log.lock().created.clone()
    }

    pub fn closed(&self) -> Vec<TransportHandle> {
        self.log.lock().closed.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.log.lock().candidates.clone()
    }

    pub fn encodings(&self) -> Vec<EncodingParameters> {
        self.log.lock().encodings.clone()
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn create_session(&self, _peer_id: &PeerId) -> Result<TransportHandle> {
        let mut log = self.log.lock();
        log.next_handle += 1;
        let handle = TransportHandle(log.next_handle);
        log.created.push(handle);
        Ok(handle)
    }

    fn create_offer(&self, handle: TransportHandle) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer for {handle}")))
    }

    fn create_answer(&self, handle: TransportHandle) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer for {handle}")))
    }

    fn set_local_description(&self, _: TransportHandle, _: &SessionDescription) -> Result<()> {
        Ok(())
    }

    fn set_remote_description(&self, _: TransportHandle, _: &SessionDescription) -> Result<()> {
        Ok(())
    }

    fn add_candidate(&self, _: TransportHandle, candidate: &IceCandidate) -> Result<()> {
        self.log.lock().candidates.push(candidate.candidate.clone());
        Ok(())
    }

    async fn get_stats(&self, _: TransportHandle) -> Result<RawStatsSnapshot> {
        let mut log = self.log.lock();
        let snapshot = if log.stats.len() > 1 {
            log.stats.pop_front()
        } else {
            log.stats.front().cloned()
        };
        Ok(snapshot.unwrap_or_default())
    }

    fn set_encoding_parameters(
        &self,
        _: TransportHandle,
        parameters: &EncodingParameters,
    ) -> Result<()> {
        let mut log = self.log.lock();
        if log.reject_encoding {
            return Err(Error::Transport("encoder rejected parameters".to_string()));
        }
        log.encodings.push(*parameters);
        Ok(())
    }

    fn close(&self, handle: TransportHandle) -> Result<()> {
        self.log.lock().closed.push(handle);
        Ok(())
    }
}

/// Signaling double recording every outbound message
#[derive(Default)]
pub struct FakeSignaling {
    sent: Mutex<Vec<(PeerId, SignalingMessage)>>,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(PeerId, SignalingMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send(&self, peer_id: &PeerId, message: SignalingMessage) -> Result<()> {
        self.sent.lock().push((peer_id.clone(), message));
        Ok(())
    }
}

/// Registry for `room1` driven by the given doubles
pub fn test_registry(
    config: RtcConfig,
    transport: &Arc<FakeTransport>,
    signaling: &Arc<FakeSignaling>,
) -> SessionRegistry {
    SessionRegistry::new(
        RoomId::from("room1"),
        PeerId::from("local"),
        config,
        Arc::clone(transport) as Arc<dyn MediaTransport>,
        Arc::clone(signaling) as Arc<dyn SignalingChannel>,
    )
    .unwrap()
}

/// Snapshot with a nominated candidate pair and one remote-inbound report
pub fn stats_snapshot(rtt_ms: f64, loss: f64, bandwidth_kbps: f64) -> RawStatsSnapshot {
    RawStatsSnapshot {
        reports: vec![
            StatsReport {
                id: "CP1".to_string(),
                timestamp_ms: 0.0,
                kind: StatsReportKind::CandidatePair {
                    nominated: true,
                    current_round_trip_time_ms: Some(rtt_ms),
                    available_outgoing_bitrate_bps: Some(bandwidth_kbps * 1000.0),
                },
            },
            StatsReport {
                id: "RI1".to_string(),
                timestamp_ms: 0.0,
                kind: StatsReportKind::RemoteInboundRtp {
                    round_trip_time_ms: Some(rtt_ms),
                    jitter_ms: Some(3.0),
                    packets_lost: None,
                    fraction_lost: Some(loss),
                },
            },
        ],
    }
}

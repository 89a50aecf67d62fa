//! Shared doubles for the session flow tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

use synctv_rtc::{
    EncodingParameters, IceCandidate, MediaTransport, PeerId, RawStatsSnapshot, Result,
    RoomId, RtcConfig, SessionDescription, SessionEvent, SessionRegistry, SignalingChannel,
    SignalingMessage, StatsReport, StatsReportKind, TransportHandle,
};

#[derive(Default)]
struct Calls {
    next_handle: u64,
    created: Vec<TransportHandle>,
    closed: Vec<TransportHandle>,
    candidates: Vec<String>,
    encodings: Vec<EncodingParameters>,
    stats: VecDeque<RawStatsSnapshot>,
}

/// Records every transport call; stats snapshots are served in order and
/// the last one repeats
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Calls>,
}

impl RecordingTransport {
    pub fn push_stats(&self, snapshot: RawStatsSnapshot) {
        self.calls.lock().stats.push_back(snapshot);
    }

    pub fn created(&self) -> Vec<TransportHandle> {
        self.calls.lock().created.clone()
    }

    pub fn closed(&self) -> Vec<TransportHandle> {
        self.calls.lock().closed.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.calls.lock().candidates.clone()
    }

    pub fn encodings(&self) -> Vec<EncodingParameters> {
        self.calls.lock().encodings.clone()
    }
}

#[async_trait]
impl MediaTransport for RecordingTransport {
    fn create_session(&self, _peer_id: &PeerId) -> Result<TransportHandle> {
        let mut calls = self.calls.lock();
        calls.next_handle += 1;
        let handle = TransportHandle(calls.next_handle);
        calls.created.push(handle);
        Ok(handle)
    }

    fn create_offer(&self, handle: TransportHandle) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("v=0 offer {handle}")))
    }

    fn create_answer(&self, handle: TransportHandle) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("v=0 answer {handle}")))
    }

    fn set_local_description(&self, _: TransportHandle, _: &SessionDescription) -> Result<()> {
        Ok(())
    }

    fn set_remote_description(&self, _: TransportHandle, _: &SessionDescription) -> Result<()> {
        Ok(())
    }

    fn add_candidate(&self, _: TransportHandle, candidate: &IceCandidate) -> Result<()> {
        self.calls.lock().candidates.push(candidate.candidate.clone());
        Ok(())
    }

    async fn get_stats(&self, _: TransportHandle) -> Result<RawStatsSnapshot> {
        let mut calls = self.calls.lock();
        let snapshot = if calls.stats.len() > 1 {
            calls.stats.pop_front()
        } else {
            calls.stats.front().cloned()
        };
        Ok(snapshot.unwrap_or_default())
    }

    fn set_encoding_parameters(
        &self,
        _: TransportHandle,
        parameters: &EncodingParameters,
    ) -> Result<()> {
        self.calls.lock().encodings.push(*parameters);
        Ok(())
    }

    fn close(&self, handle: TransportHandle) -> Result<()> {
        self.calls.lock().closed.push(handle);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<(PeerId, SignalingMessage)>>,
}

impl RecordingSignaling {
    pub fn sent(&self) -> Vec<(PeerId, SignalingMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, peer_id: &PeerId, message: SignalingMessage) -> Result<()> {
        self.sent.lock().push((peer_id.clone(), message));
        Ok(())
    }
}

/// Never completes a send; `entered` fires once one is in flight
#[derive(Default)]
pub struct StalledSignaling {
    pub entered: Notify,
}

#[async_trait]
impl SignalingChannel for StalledSignaling {
    async fn send(&self, _peer_id: &PeerId, _message: SignalingMessage) -> Result<()> {
        self.entered.notify_one();
        std::future::pending::<Result<()>>().await
    }
}

pub fn registry_with(
    config: RtcConfig,
    transport: &Arc<RecordingTransport>,
    signaling: Arc<dyn SignalingChannel>,
) -> SessionRegistry {
    SessionRegistry::new(
        room(),
        PeerId::from("local"),
        config,
        Arc::clone(transport) as Arc<dyn MediaTransport>,
        signaling,
    )
    .unwrap()
}

/// Everything already waiting on `events`
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub struct Harness {
    pub registry: SessionRegistry,
    pub transport: Arc<RecordingTransport>,
    pub signaling: Arc<RecordingSignaling>,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RtcConfig::default())
    }

    pub fn with_config(config: RtcConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let signaling = Arc::new(RecordingSignaling::default());
        let registry = registry_with(
            config,
            &transport,
            Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
        );
        let events = registry.subscribe();

        Self {
            registry,
            transport,
            signaling,
            events,
        }
    }

    /// Everything published since the last drain
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        drain(&mut self.events)
    }
}

pub fn room() -> RoomId {
    RoomId::from("room1")
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 UDP 2130706431 192.168.1.{n} 5000{n} typ host"
    ))
}

/// Snapshot with a nominated candidate pair and one remote-inbound report
pub fn stats(rtt_ms: f64, loss: f64, bandwidth_kbps: f64) -> RawStatsSnapshot {
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
                    jitter_ms: Some(2.0),
                    packets_lost: None,
                    fraction_lost: Some(loss),
                },
            },
        ],
    }
}

/// Outbound and remote-inbound reports only, as sent before a candidate
/// pair is nominated
pub fn stats_without_pair(at_ms: f64, bytes_sent: u64, rtt_ms: f64) -> RawStatsSnapshot {
    RawStatsSnapshot {
        reports: vec![
            StatsReport {
                id: "OT1".to_string(),
                timestamp_ms: at_ms,
                kind: StatsReportKind::OutboundRtp {
                    bytes_sent,
                    packets_sent: bytes_sent / 1_000,
                },
            },
            StatsReport {
                id: "RI1".to_string(),
                timestamp_ms: at_ms,
                kind: StatsReportKind::RemoteInboundRtp {
                    round_trip_time_ms: Some(rtt_ms),
                    jitter_ms: Some(2.0),
                    packets_lost: Some(0),
                    fraction_lost: None,
                },
            },
        ],
    }
}

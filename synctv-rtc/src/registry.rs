//! Session registry - per-room orchestration of peer connections
//!
//! This module provides:
//! - The imperative API used by the room session (open, close, overrides)
//! - Routing of inbound signaling and transport events to the right peer
//! - Background tasks per peer: establishment timeout, reconnection
//!   backoff and stats sampling
//!
//! Every peer owns one unit (connection, sampler, adaptation engine and
//! retry controller) behind its own async mutex, so work for one peer runs
//! one step at a time while different peers proceed concurrently. Background
//! tasks only hold a weak reference to the registry plus the peer id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RtcConfig;
use crate::connection::{Connection, ConnectionState};
use crate::events::{EventBus, SessionEvent};
use crate::quality::{
    AdaptationEngine, ProfileLadder, QualityDecision, QualitySample, StreamProfile,
};
use crate::retry::RetryController;
use crate::sampler::StatsSampler;
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::transport::{
    IceCandidate, MediaTransport, SdpType, SessionDescription, TransportEvent, TransportHandle,
};
use crate::types::{PeerId, RoomId};
use crate::{Error, Result};

/// Everything owned for one remote peer
struct PeerUnit {
    connection: Connection,
    sampler: StatsSampler,
    engine: AdaptationEngine,
    retry: RetryController,
    /// Armed while a negotiation attempt is in flight
    timeout: Option<CancellationToken>,
}

struct PeerSlot {
    id: PeerId,
    /// Cancelled first on close, so in-flight sends and stats queries yield
    lifetime: CancellationToken,
    unit: Mutex<PeerUnit>,
}

struct Inner {
    room_id: RoomId,
    local_id: PeerId,
    config: Arc<RtcConfig>,
    ladder: Arc<ProfileLadder>,
    events: EventBus,
    transport: Arc<dyn MediaTransport>,
    signaling: Arc<dyn SignalingChannel>,
    peers: DashMap<PeerId, Arc<PeerSlot>>,
    adaptation_failures: AtomicU64,
    shutdown: CancellationToken,
}

/// Peer connections of one room session
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create a registry for `room_id` on behalf of the local participant
    pub fn new(
        room_id: RoomId,
        local_id: PeerId,
        config: RtcConfig,
        transport: Arc<dyn MediaTransport>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<Self> {
        Self::with_ladder(
            room_id,
            local_id,
            config,
            ProfileLadder::standard(),
            transport,
            signaling,
        )
    }

    /// Create a registry with a custom profile ladder
    pub fn with_ladder(
        room_id: RoomId,
        local_id: PeerId,
        config: RtcConfig,
        ladder: ProfileLadder,
        transport: Arc<dyn MediaTransport>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<Self> {
        config.validate_for(&ladder)?;
        let ladder = Arc::new(ladder);

        info!(
            room_id = %room_id,
            local_id = %local_id,
            tiers = ladder.len(),
            max_attempts = config.retry.max_attempts,
            sample_interval_ms = config.sampler.interval_ms,
            "Session registry initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                events: EventBus::new(config.session.event_capacity),
                room_id,
                local_id,
                config: Arc::new(config),
                ladder,
                transport,
                signaling,
                peers: DashMap::new(),
                adaptation_failures: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    #[must_use]
    pub fn config(&self) -> &RtcConfig {
        &self.inner.config
    }

    /// Start negotiating with `peer_id` by sending it an offer
    ///
    /// Fails with a signaling error when a live connection to the peer
    /// already exists or the offer cannot be delivered. Transport failures
    /// are handed to the reconnection path and reported as events.
    pub async fn open_connection(&self, peer_id: PeerId) -> Result<()> {
        self.inner.open_connection(peer_id).await
    }

    /// Apply a remote offer or answer
    pub async fn handle_remote_description(
        &self,
        peer_id: PeerId,
        description: SessionDescription,
    ) -> Result<()> {
        match description.sdp_type {
            SdpType::Answer => self.inner.apply_answer(peer_id, description).await,
            SdpType::Offer => self.inner.apply_offer(peer_id, description).await,
        }
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is known
    pub async fn add_remote_candidate(&self, peer_id: PeerId, candidate: IceCandidate) -> Result<()> {
        self.inner.add_remote_candidate(peer_id, candidate).await
    }

    /// Route one inbound signaling message
    pub async fn handle_signaling_message(
        &self,
        from: PeerId,
        message: SignalingMessage,
    ) -> Result<()> {
        if message.room_id() != &self.inner.room_id {
            warn!(
                peer_id = %from,
                room_id = %self.inner.room_id,
                message_room = %message.room_id(),
                "Rejected signaling message for another room"
            );
            return Err(Error::Signaling(format!(
                "message from {from} is scoped to room {}",
                message.room_id()
            )));
        }

        match message {
            SignalingMessage::Offer { sdp, .. } if sdp.sdp_type == SdpType::Offer => {
                self.handle_remote_description(from, sdp).await
            }
            SignalingMessage::Answer { sdp, .. } if sdp.sdp_type == SdpType::Answer => {
                self.handle_remote_description(from, sdp).await
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.add_remote_candidate(from, candidate).await
            }
            SignalingMessage::Offer { sdp, .. } | SignalingMessage::Answer { sdp, .. } => {
                Err(Error::Signaling(format!(
                    "message from {from} carries a mismatched {} description",
                    sdp.sdp_type.as_str()
                )))
            }
        }
    }

    /// Feed a connection-state report from the media transport
    pub async fn handle_transport_event(&self, peer_id: PeerId, event: TransportEvent) -> Result<()> {
        self.inner.handle_transport_event(peer_id, event).await
    }

    /// Tear down the connection to `peer_id`
    ///
    /// Idempotent: closing an unknown or already closed peer is a no-op.
    pub async fn close_connection(&self, peer_id: &PeerId) -> Result<()> {
        self.inner.close_connection(peer_id).await;
        Ok(())
    }

    /// Switch `peer_id` to `tier_name` immediately, bypassing the dwell window
    pub async fn request_quality_override(
        &self,
        peer_id: &PeerId,
        tier_name: &str,
    ) -> Result<QualityDecision> {
        self.inner.request_quality_override(peer_id, tier_name).await
    }

    /// Resume automatic adaptation after a sticky override
    pub async fn clear_quality_override(&self, peer_id: &PeerId) -> Result<()> {
        let slot = self.inner.live_slot(peer_id)?;
        let mut unit = slot.unit.lock().await;
        ensure_open(peer_id, &unit)?;
        unit.engine.clear_override();
        debug!(peer_id = %peer_id, "Quality override cleared");
        Ok(())
    }

    pub async fn current_profile(&self, peer_id: &PeerId) -> Result<Arc<StreamProfile>> {
        let slot = self.inner.live_slot(peer_id)?;
        let unit = slot.unit.lock().await;
        ensure_open(peer_id, &unit)?;
        Ok(unit.engine.current_profile())
    }

    /// Recorded quality samples, oldest first
    pub async fn recent_samples(&self, peer_id: &PeerId) -> Result<Vec<QualitySample>> {
        let slot = self.inner.live_slot(peer_id)?;
        let unit = slot.unit.lock().await;
        ensure_open(peer_id, &unit)?;
        Ok(unit.sampler.samples())
    }

    /// Applied quality decisions, oldest first
    pub async fn decision_history(&self, peer_id: &PeerId) -> Result<Vec<QualityDecision>> {
        let slot = self.inner.live_slot(peer_id)?;
        let unit = slot.unit.lock().await;
        ensure_open(peer_id, &unit)?;
        Ok(unit.engine.history())
    }

    pub async fn connection_state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        let slot = self.inner.slot(peer_id)?;
        let unit = slot.unit.lock().await;
        Some(unit.connection.state())
    }

    /// Peers with a live connection entry
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Encoding changes the transport rejected so far
    #[must_use]
    pub fn adaptation_failures(&self) -> u64 {
        self.inner.adaptation_failures.load(Ordering::Relaxed)
    }

    /// Events published on the bus since the registry was created
    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.inner.events.published_count()
    }

    /// Close every connection and refuse new ones
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let peers = self.peer_ids();
        info!(
            room_id = %self.inner.room_id,
            peers = peers.len(),
            "Shutting down session registry"
        );
        for peer_id in peers {
            self.inner.close_connection(&peer_id).await;
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("room_id", &self.inner.room_id)
            .field("local_id", &self.inner.local_id)
            .field("peers", &self.inner.peers.len())
            .finish_non_exhaustive()
    }
}

fn ensure_open(peer_id: &PeerId, unit: &PeerUnit) -> Result<()> {
    if unit.connection.is_closed() {
        return Err(Error::NotFound(format!("connection to {peer_id}")));
    }
    Ok(())
}

impl Inner {
    fn slot(&self, peer_id: &PeerId) -> Option<Arc<PeerSlot>> {
        self.peers.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    fn live_slot(&self, peer_id: &PeerId) -> Result<Arc<PeerSlot>> {
        self.slot(peer_id)
            .ok_or_else(|| Error::NotFound(format!("connection to {peer_id}")))
    }

    /// Look up the peer's slot, creating a fresh `New` connection if needed
    fn slot_or_insert(&self, peer_id: &PeerId) -> Result<Arc<PeerSlot>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Signaling(format!(
                "session for room {} is shut down",
                self.room_id
            )));
        }
        if peer_id == &self.local_id {
            return Err(Error::InvalidInput(format!(
                "cannot connect to the local participant {peer_id}"
            )));
        }

        match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let slot = Arc::new(self.new_slot(peer_id)?);
                entry.insert(Arc::clone(&slot));
                debug!(
                    peer_id = %peer_id,
                    total_peers = self.peers.len(),
                    "Created connection entry"
                );
                Ok(slot)
            }
        }
    }

    fn new_slot(&self, peer_id: &PeerId) -> Result<PeerSlot> {
        let config = &self.config;
        let unit = PeerUnit {
            connection: Connection::new(peer_id.clone(), config.session.max_buffered_candidates),
            sampler: StatsSampler::new(&config.sampler),
            engine: AdaptationEngine::new(
                Arc::clone(&self.ladder),
                &config.adaptation,
                &config.thresholds,
            )?
            .with_target_latency(config.session.target_latency()),
            retry: RetryController::new(&config.retry),
            timeout: None,
        };

        Ok(PeerSlot {
            id: peer_id.clone(),
            lifetime: self.shutdown.child_token(),
            unit: Mutex::new(unit),
        })
    }

    fn publish_error(&self, peer_id: &PeerId, error: &Error) {
        self.events.publish(SessionEvent::ConnectionError {
            peer_id: peer_id.clone(),
            kind: error.kind(),
            detail: error.to_string(),
        });
    }

    /// Surface a protocol violation on the bus and hand it back to the caller
    fn reject(&self, peer_id: &PeerId, error: Error) -> Error {
        warn!(peer_id = %peer_id, error = %error, "Rejected signaling input");
        self.publish_error(peer_id, &error);
        error
    }

    /// Apply a state transition and announce it
    ///
    /// Returns `false` when the connection is already closed.
    fn set_state(&self, unit: &mut PeerUnit, next: ConnectionState) -> Result<bool> {
        let Some(previous) = unit.connection.transition(next)? else {
            return Ok(false);
        };

        if next != ConnectionState::Connected {
            unit.sampler.stop();
        }

        let peer_id = unit.connection.peer_id().clone();
        debug!(
            peer_id = %peer_id,
            from = %previous,
            to = %next,
            "Connection state changed"
        );
        self.events.publish(SessionEvent::ConnectionStateChanged {
            peer_id,
            state: next,
        });
        Ok(true)
    }

    fn ensure_session(&self, unit: &mut PeerUnit) -> Result<TransportHandle> {
        if let Some(handle) = unit.connection.handle() {
            return Ok(handle);
        }
        let handle = self.transport.create_session(unit.connection.peer_id())?;
        unit.connection.attach(handle);
        debug!(
            peer_id = %unit.connection.peer_id(),
            handle = %handle,
            "Transport session created"
        );
        Ok(handle)
    }

    /// Release the transport session, if any, exactly once
    fn release_session(&self, unit: &mut PeerUnit) {
        if let Some(handle) = unit.connection.detach() {
            if let Err(e) = self.transport.close(handle) {
                warn!(
                    peer_id = %unit.connection.peer_id(),
                    handle = %handle,
                    error = %e,
                    "Failed to release transport session"
                );
            }
        }
    }

    fn disarm_timeout(unit: &mut PeerUnit) {
        if let Some(token) = unit.timeout.take() {
            token.cancel();
        }
    }

    /// Send through the signaling channel unless the peer is closed first.
    /// Returns `Ok(false)` when the close won.
    async fn send(&self, slot: &PeerSlot, message: SignalingMessage) -> Result<bool> {
        tokio::select! {
            biased;
            () = slot.lifetime.cancelled() => Ok(false),
            result = self.signaling.send(&slot.id, message) => match result {
                Ok(()) => Ok(true),
                Err(e @ Error::Signaling(_)) => Err(e),
                Err(e) => Err(Error::Signaling(e.to_string())),
            },
        }
    }

    fn flush_candidates(&self, unit: &mut PeerUnit, handle: TransportHandle) {
        let candidates = unit.connection.mark_remote_description_set();
        if candidates.is_empty() {
            return;
        }

        let count = candidates.len();
        for candidate in &candidates {
            if let Err(e) = self.transport.add_candidate(handle, candidate) {
                warn!(
                    peer_id = %unit.connection.peer_id(),
                    candidate = %candidate.candidate,
                    error = %e,
                    "Failed to apply buffered candidate"
                );
            }
        }
        debug!(
            peer_id = %unit.connection.peer_id(),
            count,
            "Flushed buffered candidates"
        );
    }

    async fn open_connection(self: &Arc<Self>, peer_id: PeerId) -> Result<()> {
        let slot = self.slot_or_insert(&peer_id)?;
        let mut unit = slot.unit.lock().await;

        match unit.connection.state() {
            ConnectionState::New => {}
            ConnectionState::Closed => {
                return Err(Error::Signaling(format!(
                    "connection to {peer_id} was closed while opening"
                )));
            }
            state => {
                return Err(Error::Signaling(format!(
                    "connection to {peer_id} already exists ({state})"
                )));
            }
        }

        info!(
            room_id = %self.room_id,
            peer_id = %peer_id,
            "Opening connection"
        );
        self.start_offer(&slot, &mut unit).await
    }

    /// Run the offer path: `Offering`, create and send the offer,
    /// `AwaitingAnswer`
    async fn start_offer(self: &Arc<Self>, slot: &PeerSlot, unit: &mut PeerUnit) -> Result<()> {
        if !self.set_state(unit, ConnectionState::Offering)? {
            return Ok(());
        }
        let epoch = unit.connection.begin_attempt();
        self.arm_timeout(slot, unit, epoch);

        let offer = match self.create_local_offer(unit) {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(slot, unit, &e);
                return Ok(());
            }
        };

        let message = SignalingMessage::description(self.room_id.clone(), offer);
        match self.send(slot, message).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                self.fail(slot, unit, &e);
                return Err(e);
            }
        }

        self.set_state(unit, ConnectionState::AwaitingAnswer)?;
        Ok(())
    }

    fn create_local_offer(&self, unit: &mut PeerUnit) -> Result<SessionDescription> {
        let handle = self.ensure_session(unit)?;
        let offer = self.transport.create_offer(handle)?;
        self.transport.set_local_description(handle, &offer)?;
        unit.connection.mark_local_description_set();
        Ok(offer)
    }

    async fn apply_answer(self: &Arc<Self>, peer_id: PeerId, answer: SessionDescription) -> Result<()> {
        let Some(slot) = self.slot(&peer_id) else {
            return Err(self.reject(
                &peer_id,
                Error::Signaling(format!("answer from {peer_id} with no pending offer")),
            ));
        };
        let mut unit = slot.unit.lock().await;

        let next = match unit.connection.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::AwaitingAnswer | ConnectionState::Connecting => {
                ConnectionState::Connecting
            }
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                ConnectionState::Reconnecting
            }
            state => {
                return Err(self.reject(
                    &peer_id,
                    Error::Signaling(format!(
                        "answer from {peer_id} with no pending offer ({state})"
                    )),
                ));
            }
        };
        let Some(handle) = unit.connection.handle() else {
            return Err(self.reject(
                &peer_id,
                Error::Signaling(format!("answer from {peer_id} with no transport session")),
            ));
        };

        let renegotiating = unit.connection.state() == ConnectionState::Connected;
        self.set_state(&mut unit, next)?;
        if renegotiating {
            let epoch = unit.connection.begin_attempt();
            self.arm_timeout(&slot, &mut unit, epoch);
        }

        if let Err(e) = self.transport.set_remote_description(handle, &answer) {
            self.fail(&slot, &mut unit, &e);
            return Ok(());
        }
        self.flush_candidates(&mut unit, handle);
        Ok(())
    }

    async fn apply_offer(self: &Arc<Self>, peer_id: PeerId, offer: SessionDescription) -> Result<()> {
        let slot = self.slot_or_insert(&peer_id)?;
        let mut unit = slot.unit.lock().await;

        let next = match unit.connection.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::New | ConnectionState::Connecting => ConnectionState::Connecting,
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                ConnectionState::Reconnecting
            }
            state => {
                return Err(self.reject(
                    &peer_id,
                    Error::Signaling(format!("unexpected offer from {peer_id} ({state})")),
                ));
            }
        };

        // The remote side restarted negotiation, so a pending backoff is moot
        unit.retry.cancel();
        self.set_state(&mut unit, next)?;
        let epoch = unit.connection.begin_attempt();
        self.arm_timeout(&slot, &mut unit, epoch);

        let answer = match self.accept_offer(&mut unit, &offer) {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(&slot, &mut unit, &e);
                return Ok(());
            }
        };

        let message = SignalingMessage::description(self.room_id.clone(), answer);
        match self.send(&slot, message).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.fail(&slot, &mut unit, &e);
                Err(e)
            }
        }
    }

    fn accept_offer(&self, unit: &mut PeerUnit, offer: &SessionDescription) -> Result<SessionDescription> {
        let handle = self.ensure_session(unit)?;
        self.transport.set_remote_description(handle, offer)?;
        self.flush_candidates(unit, handle);

        let answer = self.transport.create_answer(handle)?;
        self.transport.set_local_description(handle, &answer)?;
        unit.connection.mark_local_description_set();
        Ok(answer)
    }

    async fn add_remote_candidate(
        self: &Arc<Self>,
        peer_id: PeerId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let slot = self.slot_or_insert(&peer_id)?;
        let mut unit = slot.unit.lock().await;
        if unit.connection.is_closed() {
            return Ok(());
        }

        // An entry nobody negotiates on is discarded once the timeout passes
        if unit.connection.state() == ConnectionState::New && unit.timeout.is_none() {
            let epoch = unit.connection.epoch();
            self.arm_timeout(&slot, &mut unit, epoch);
        }

        if unit.connection.remote_description_set() {
            if let Some(handle) = unit.connection.handle() {
                return self.transport.add_candidate(handle, &candidate);
            }
        }

        let dropped = unit.connection.buffer_candidate(candidate);
        if dropped > 0 {
            warn!(
                peer_id = %peer_id,
                dropped,
                capacity = self.config.session.max_buffered_candidates,
                "Candidate buffer full, dropped oldest"
            );
            self.events.publish(SessionEvent::CandidatesDropped { peer_id, dropped });
        }
        Ok(())
    }

    async fn handle_transport_event(self: &Arc<Self>, peer_id: PeerId, event: TransportEvent) -> Result<()> {
        let slot = self.live_slot(&peer_id)?;
        let mut unit = slot.unit.lock().await;

        // Reports for a session already released are stale
        if unit.connection.is_closed() || unit.connection.handle().is_none() {
            debug!(peer_id = %peer_id, ?event, "Ignoring stale transport event");
            return Ok(());
        }

        match event {
            TransportEvent::Connected => match unit.connection.state() {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    Self::disarm_timeout(&mut unit);
                    unit.retry.cancel();
                    self.set_state(&mut unit, ConnectionState::Connected)?;
                    info!(
                        peer_id = %peer_id,
                        attempts = unit.connection.attempts(),
                        "Connection established"
                    );
                    self.events.publish(SessionEvent::ConnectionEstablished {
                        peer_id: peer_id.clone(),
                    });
                    self.start_sampler(&slot, &mut unit);
                }
                state => {
                    debug!(peer_id = %peer_id, %state, "Ignoring connected report");
                }
            },
            TransportEvent::Failed(detail) => {
                self.fail(&slot, &mut unit, &Error::Transport(detail));
            }
            TransportEvent::Closed => {
                self.fail(
                    &slot,
                    &mut unit,
                    &Error::Transport("transport closed the session".to_string()),
                );
            }
            TransportEvent::RemoteMediaAvailable => {
                self.events
                    .publish(SessionEvent::RemoteMediaAvailable { peer_id });
            }
        }
        Ok(())
    }

    /// Move the connection to `Failed`, release its transport session and
    /// schedule a reconnection if the failure is recoverable
    fn fail(self: &Arc<Self>, slot: &PeerSlot, unit: &mut PeerUnit, error: &Error) {
        let state = unit.connection.state();
        if matches!(state, ConnectionState::Closed | ConnectionState::Failed) {
            return;
        }

        warn!(
            peer_id = %slot.id,
            %state,
            error = %error,
            "Connection failed"
        );
        self.publish_error(&slot.id, error);

        Self::disarm_timeout(unit);
        self.release_session(unit);

        match self.set_state(unit, ConnectionState::Failed) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                // New has no failure edge; the connection just goes idle
                debug!(peer_id = %slot.id, error = %e, "Failure without negotiation");
                return;
            }
        }

        if error.is_retryable() {
            self.schedule_retry(slot, unit);
        }
    }

    fn schedule_retry(self: &Arc<Self>, slot: &PeerSlot, unit: &mut PeerUnit) {
        let attempt = unit.connection.attempts();
        if !unit.connection.record_attempt(unit.retry.max_attempts()) {
            if unit.retry.exhaust() {
                let error = Error::Capacity(format!(
                    "gave up on {} after {attempt} reconnection attempts",
                    slot.id
                ));
                error!(peer_id = %slot.id, attempts = attempt, "Reconnection attempts exhausted");
                self.publish_error(&slot.id, &error);
            }
            return;
        }

        let delay = unit.retry.delay(attempt);
        if !matches!(self.set_state(unit, ConnectionState::Reconnecting), Ok(true)) {
            return;
        }

        info!(
            peer_id = %slot.id,
            attempt = attempt + 1,
            max_attempts = unit.retry.max_attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnection"
        );

        let token = unit.retry.arm(&slot.lifetime);
        let registry = Arc::downgrade(self);
        let peer_id = slot.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(inner) = registry.upgrade() {
                        inner.retry_fired(&peer_id, &token).await;
                    }
                }
            }
        });
    }

    async fn retry_fired(self: &Arc<Self>, peer_id: &PeerId, token: &CancellationToken) {
        let Some(slot) = self.slot(peer_id) else {
            return;
        };
        let mut unit = slot.unit.lock().await;
        if token.is_cancelled() || unit.connection.state() != ConnectionState::Reconnecting {
            return;
        }
        unit.retry.fired();

        debug!(
            peer_id = %peer_id,
            attempt = unit.connection.attempts(),
            "Retrying connection"
        );
        if let Err(e) = self.start_offer(&slot, &mut unit).await {
            warn!(peer_id = %peer_id, error = %e, "Reconnection attempt failed");
        }
    }

    fn arm_timeout(self: &Arc<Self>, slot: &PeerSlot, unit: &mut PeerUnit, epoch: u64) {
        Self::disarm_timeout(unit);
        let token = slot.lifetime.child_token();
        unit.timeout = Some(token.clone());

        let after = self.config.session.connect_timeout();
        let registry = Arc::downgrade(self);
        let peer_id = slot.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    if let Some(inner) = registry.upgrade() {
                        inner.timeout_fired(&peer_id, epoch).await;
                    }
                }
            }
        });
    }

    async fn timeout_fired(self: &Arc<Self>, peer_id: &PeerId, epoch: u64) {
        let Some(slot) = self.slot(peer_id) else {
            return;
        };
        let mut unit = slot.unit.lock().await;
        if unit.connection.epoch() != epoch || unit.retry.is_pending() {
            return;
        }

        match unit.connection.state() {
            ConnectionState::New => {
                unit.timeout = None;
                // The map entry may have been replaced since the lookup
                if self
                    .peers
                    .remove_if(peer_id, |_, current| Arc::ptr_eq(current, &slot))
                    .is_some()
                {
                    debug!(
                        peer_id = %peer_id,
                        buffered = unit.connection.buffered_candidates(),
                        "Discarding connection entry that never negotiated"
                    );
                    slot.lifetime.cancel();
                    self.finish_close(&slot, &mut unit);
                }
            }
            state if state.is_negotiating() => {
                unit.timeout = None;
                let error = Error::Timeout(format!(
                    "no progress with {peer_id} within {} ms",
                    self.config.session.connect_timeout_ms
                ));
                self.fail(&slot, &mut unit, &error);
            }
            _ => {}
        }
    }

    fn start_sampler(self: &Arc<Self>, slot: &PeerSlot, unit: &mut PeerUnit) {
        let token = unit.sampler.start(&slot.lifetime);
        let period = self.config.sampler.interval();
        let registry: Weak<Self> = Arc::downgrade(self);
        let peer_id = slot.id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = registry.upgrade() else {
                            break;
                        };
                        if !inner.sample_tick(&peer_id, &token).await {
                            break;
                        }
                    }
                }
            }
            debug!(peer_id = %peer_id, "Stats sampler stopped");
        });
    }

    /// One sampling pass. Returns `false` once sampling should end.
    async fn sample_tick(&self, peer_id: &PeerId, token: &CancellationToken) -> bool {
        let Some(slot) = self.slot(peer_id) else {
            return false;
        };
        let mut unit = slot.unit.lock().await;
        if token.is_cancelled() || unit.connection.state() != ConnectionState::Connected {
            return false;
        }
        let Some(handle) = unit.connection.handle() else {
            return false;
        };

        let stats = tokio::select! {
            () = token.cancelled() => return false,
            result = self.transport.get_stats(handle) => result,
        };
        let snapshot = match stats {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to collect transport stats");
                return true;
            }
        };

        let now = Instant::now();
        let sample = unit.sampler.normalize(now, &snapshot);
        unit.sampler.record(sample);
        unit.connection.record_sample(sample);
        self.events.publish(SessionEvent::QualitySampled {
            peer_id: peer_id.clone(),
            bitrate_kbps: sample.bitrate_kbps,
            rtt_ms: sample.rtt_ms,
            jitter_ms: sample.jitter_ms,
            loss: sample.loss,
            bandwidth_kbps: sample.bandwidth_kbps,
        });

        let PeerUnit {
            sampler, engine, connection, ..
        } = &mut *unit;
        if let Some(decision) = engine.evaluate(now, sampler.window()) {
            // Rejections are counted and retried on a later tick
            let _ = self.apply_decision(connection, engine, decision);
        }
        true
    }

    /// Push a decision to the transport and commit it once accepted
    fn apply_decision(
        &self,
        connection: &Connection,
        engine: &mut AdaptationEngine,
        decision: QualityDecision,
    ) -> Result<QualityDecision> {
        let peer_id = connection.peer_id();
        let result = connection
            .handle()
            .ok_or_else(|| Error::Adaptation(format!("no transport session for {peer_id}")))
            .and_then(|handle| {
                let parameters = engine.encoding_parameters(&decision).ok_or_else(|| {
                    Error::Adaptation(format!("unknown stream tier {}", decision.new.name))
                })?;
                self.transport
                    .set_encoding_parameters(handle, &parameters)
                    .map_err(|e| {
                        Error::Adaptation(format!(
                            "{} -> {} rejected: {e}",
                            decision.previous.name, decision.new.name
                        ))
                    })
            });

        if let Err(e) = result {
            self.adaptation_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer_id = %peer_id,
                current = %decision.previous.name,
                requested = %decision.new.name,
                error = %e,
                "Stream adaptation not applied"
            );
            return Err(e);
        }

        info!(
            peer_id = %peer_id,
            from = %decision.previous.name,
            to = %decision.new.name,
            reason = ?decision.reason,
            confidence = decision.confidence,
            "Stream profile adapted"
        );
        self.events.publish(SessionEvent::QualityAdapted {
            peer_id: peer_id.clone(),
            previous: decision.previous.name.clone(),
            new: decision.new.name.clone(),
            reason: decision.reason.code(),
            confidence: decision.confidence,
        });
        engine.commit(decision.clone());
        Ok(decision)
    }

    async fn request_quality_override(
        &self,
        peer_id: &PeerId,
        tier_name: &str,
    ) -> Result<QualityDecision> {
        let slot = self.live_slot(peer_id)?;
        let mut unit = slot.unit.lock().await;
        ensure_open(peer_id, &unit)?;

        let PeerUnit {
            engine, connection, ..
        } = &mut *unit;
        let decision = engine.override_decision(Instant::now(), tier_name)?;
        self.apply_decision(connection, engine, decision)
    }

    async fn close_connection(&self, peer_id: &PeerId) {
        // Removal first: a second close finds nothing and does nothing
        let Some((_, slot)) = self.peers.remove(peer_id) else {
            return;
        };
        slot.lifetime.cancel();

        let mut unit = slot.unit.lock().await;
        self.finish_close(&slot, &mut unit);
    }

    /// Stop everything the unit runs and move it to `Closed`. The slot must
    /// already be out of the peer map.
    fn finish_close(&self, slot: &PeerSlot, unit: &mut PeerUnit) {
        unit.retry.cancel();
        unit.sampler.stop();
        Self::disarm_timeout(unit);
        self.release_session(unit);

        if matches!(self.set_state(unit, ConnectionState::Closed), Ok(true)) {
            info!(
                peer_id = %slot.id,
                remaining_peers = self.peers.len(),
                "Connection closed"
            );
            self.events.publish(SessionEvent::ConnectionClosed {
                peer_id: slot.id.clone(),
            });
        }
    }
}

//! Session-scoped set of peer records and their negotiation state machine.
//!
//! The registry is owned by the session loop and only ever touched through
//! `&mut self`, so no two negotiation steps interleave. Connection callbacks
//! reach it as [`PeerEvent`]s on the channel returned by [`PeerRegistry::new`],
//! tagged with the generation of the connection that produced them.

use super::handle::{PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender};
use super::state::{PeerRecord, PeerSummary};
use super::types::{
    Health, IceCandidate, NegotiationPhase, RemoteTrack, Role, SdpKind, SessionDescription,
    Signal, TransportState,
};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, MediaKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a `peer-joined` announcement.
#[derive(Debug)]
pub enum JoinOutcome {
    /// A new offerer-role record was created; the offer must be relayed.
    Created(Signal),
    /// The identifier was already registered; nothing was reset.
    Existing,
}

/// Result of a `peer-left` announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Removed,
    /// Media path still up; the record waits for its transport to drop.
    Orphaned,
    Unknown,
}

/// What the session has to act on after a connection event.
#[derive(Debug)]
pub enum PeerUpdate {
    Outbound {
        peer_id: String,
        signal: Signal,
    },
    Transport {
        peer_id: String,
        state: TransportState,
        health: Health,
    },
    RemoteTrack {
        peer_id: String,
        track: RemoteTrack,
    },
    Removed {
        peer_id: String,
    },
    /// The path stayed down past the grace period (or failed outright) and
    /// this side holds the offerer role: an ICE restart is due.
    RecoveryDue {
        peer_id: String,
    },
}

pub struct PeerRegistry {
    /// Identifier of the local participant, used to settle offer collisions.
    local_id: String,
    connector: Arc<dyn PeerConnector>,
    records: HashMap<String, PeerRecord>,
    local_tracks: HashMap<MediaKind, LocalTrack>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_generation: u64,
    grace_period: Duration,
    recovery_timers: HashMap<String, JoinHandle<()>>,
}

impl PeerRegistry {
    pub fn new(
        local_id: impl Into<String>,
        connector: Arc<dyn PeerConnector>,
        grace_period: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            local_id: local_id.into(),
            connector,
            records: HashMap::new(),
            local_tracks: HashMap::new(),
            events,
            next_generation: 1,
            grace_period,
            recovery_timers: HashMap::new(),
        };
        (registry, rx)
    }

    /// Tracks attached to every connection created from now on.
    pub fn set_local_tracks(&mut self, tracks: Vec<LocalTrack>) {
        self.local_tracks = tracks.into_iter().map(|t| (t.kind(), t)).collect();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.records.get(peer_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<_> = self.records.values().map(PeerRecord::summary).collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Worst health across all records; `Connected` when there are none.
    pub fn worst_health(&self) -> Health {
        self.records
            .values()
            .map(PeerRecord::health)
            .max()
            .unwrap_or(Health::Connected)
    }

    /// Seeds answerer-role records for peers already in the room. Known
    /// identifiers are left untouched. Returns the identifiers created.
    pub async fn add_existing_peers(&mut self, peers: &[String]) -> Vec<String> {
        let mut created = Vec::new();
        for peer_id in peers {
            if self.records.contains_key(peer_id) {
                debug!(peer = %peer_id, "roster entry already registered");
                continue;
            }
            match self.insert_record(peer_id, Role::Answerer).await {
                Ok(()) => created.push(peer_id.clone()),
                Err(e) => warn!(peer = %peer_id, "cannot open connection: {e}"),
            }
        }
        created
    }

    /// Handles `peer-joined`: a newcomer gets an offerer-role record and an
    /// immediate offer. A duplicate announcement only refreshes the display
    /// name and clears a pending departure.
    pub async fn add_joined_peer(
        &mut self,
        peer_id: &str,
        display_name: Option<String>,
    ) -> Result<JoinOutcome, NegotiationError> {
        if let Some(record) = self.records.get_mut(peer_id) {
            record.set_display_name(display_name);
            if record.is_departed() {
                info!(peer = %peer_id, "peer rejoined before its media path dropped");
                record.set_departed(false);
            }
            return Ok(JoinOutcome::Existing);
        }

        self.insert_record(peer_id, Role::Offerer).await?;
        if let Some(record) = self.records.get_mut(peer_id) {
            record.set_display_name(display_name);
        }

        match self.offer(peer_id, false).await {
            Ok(signal) => Ok(JoinOutcome::Created(signal)),
            Err(e) => {
                self.destroy(peer_id).await;
                Err(e)
            }
        }
    }

    /// Applies one relayed negotiation payload from `from`. Returns the
    /// reply to relay back, if any.
    pub async fn handle_signal(
        &mut self,
        from: &str,
        signal: Signal,
    ) -> Result<Option<Signal>, NegotiationError> {
        if let Some(desc) = signal.sdp {
            return match desc.kind {
                SdpKind::Offer => self.accept_offer(from, desc).await,
                SdpKind::Answer => self.accept_answer(from, desc).await,
            };
        }
        if let Some(candidate) = signal.candidate {
            self.apply_candidate(from, candidate).await?;
            return Ok(None);
        }
        Err(NegotiationError::stale(from, "empty signal"))
    }

    async fn accept_offer(
        &mut self,
        from: &str,
        desc: SessionDescription,
    ) -> Result<Option<Signal>, NegotiationError> {
        let mut rebuilt = false;
        match self.records.get(from).map(PeerRecord::phase) {
            None => {
                debug!(peer = %from, "offer from unregistered peer, creating answerer record");
                self.insert_record(from, Role::Answerer).await?;
            }
            Some(phase) if !phase.accepts_offer() => {
                info!(peer = %from, "offer received in {phase}, rebuilding connection");
                self.rebuild(from, Role::Answerer).await?;
                if phase == NegotiationPhase::OfferSent {
                    if let Some(record) = self.records.get_mut(from) {
                        record.set_discarded_offer(true);
                    }
                }
                rebuilt = true;
            }
            Some(_) => {}
        }

        loop {
            match self.answer(from, desc.clone()).await {
                Ok(answer) => return Ok(Some(Signal::description(answer))),
                Err(e) if !rebuilt && !e.is_stale() => {
                    warn!(peer = %from, "cannot apply offer ({e}), rebuilding connection");
                    self.rebuild(from, Role::Answerer).await?;
                    rebuilt = true;
                }
                Err(e) => {
                    self.destroy(from).await;
                    return Err(e);
                }
            }
        }
    }

    /// After a collision both sides agree on who offers next: the smaller
    /// identifier.
    fn offers_after_collision(&self, remote: &str) -> bool {
        self.local_id.as_str() < remote
    }

    async fn answer(
        &mut self,
        from: &str,
        desc: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let connection = {
            let record = self
                .records
                .get_mut(from)
                .ok_or_else(|| NegotiationError::stale(from, "record gone"))?;
            record.advance(NegotiationPhase::OfferReceived);
            record.connection()
        };

        connection.set_remote_description(desc).await?;
        let answer = connection.create_answer().await?;

        let record = self
            .records
            .get_mut(from)
            .ok_or_else(|| NegotiationError::stale(from, "record gone"))?;
        record.advance(NegotiationPhase::Stable);
        Ok(answer)
    }

    /// Returns an offer to relay when the answer settled a collision and
    /// this side starts over as offerer.
    async fn accept_answer(
        &mut self,
        from: &str,
        desc: SessionDescription,
    ) -> Result<Option<Signal>, NegotiationError> {
        let record = self
            .records
            .get(from)
            .ok_or_else(|| NegotiationError::stale(from, "answer for unknown peer"))?;
        if record.discarded_offer() && record.phase() != NegotiationPhase::OfferSent {
            return self.settle_collision(from).await;
        }
        if record.phase() != NegotiationPhase::OfferSent {
            return Err(NegotiationError::stale(
                from,
                format!("answer received in {}", record.phase()),
            ));
        }

        let connection = record.connection();
        connection.set_remote_description(desc).await?;

        if let Some(record) = self.records.get_mut(from) {
            record.advance(NegotiationPhase::Stable);
        }
        Ok(None)
    }

    /// Both sides rebuilt for each other's offer, so each answer targets a
    /// connection the other side already closed. Start over from fresh
    /// connections with exactly one offerer.
    async fn settle_collision(
        &mut self,
        peer_id: &str,
    ) -> Result<Option<Signal>, NegotiationError> {
        if self.offers_after_collision(peer_id) {
            info!(peer = %peer_id, "settling offer collision, re-offering on a fresh connection");
            self.rebuild(peer_id, Role::Offerer).await?;
            self.clear_discarded_offer(peer_id);
            match self.offer(peer_id, false).await {
                Ok(signal) => Ok(Some(signal)),
                Err(e) => {
                    self.destroy(peer_id).await;
                    Err(e)
                }
            }
        } else {
            info!(peer = %peer_id, "settling offer collision, awaiting a fresh offer");
            self.rebuild(peer_id, Role::Answerer).await?;
            self.clear_discarded_offer(peer_id);
            Ok(None)
        }
    }

    fn clear_discarded_offer(&mut self, peer_id: &str) {
        if let Some(record) = self.records.get_mut(peer_id) {
            record.set_discarded_offer(false);
        }
    }

    async fn apply_candidate(
        &mut self,
        from: &str,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let connection = self
            .records
            .get(from)
            .map(PeerRecord::connection)
            .ok_or_else(|| NegotiationError::stale(from, "candidate for unknown peer"))?;
        if !connection.has_remote_description().await {
            return Err(NegotiationError::stale(
                from,
                "candidate before remote description",
            ));
        }
        connection.add_ice_candidate(candidate).await
    }

    /// Handles `peer-left`.
    pub async fn remove_departed(&mut self, peer_id: &str) -> Departure {
        let Some(record) = self.records.get_mut(peer_id) else {
            return Departure::Unknown;
        };
        if record.transport().is_up() {
            info!(peer = %peer_id, "peer left signaling, keeping live media path");
            record.set_departed(true);
            return Departure::Orphaned;
        }
        self.destroy(peer_id).await;
        Departure::Removed
    }

    /// Starts a renegotiation from `stable`. Only the offerer-role side may
    /// re-offer; requests on answerer-role records return `None`.
    pub async fn renegotiate(
        &mut self,
        peer_id: &str,
        ice_restart: bool,
    ) -> Result<Option<Signal>, NegotiationError> {
        let record = self
            .records
            .get_mut(peer_id)
            .ok_or_else(|| NegotiationError::stale(peer_id, "no such peer"))?;
        if record.role() != Role::Offerer {
            debug!(peer = %peer_id, "answerer side does not renegotiate");
            return Ok(None);
        }
        if record.phase() != NegotiationPhase::Stable {
            debug!(peer = %peer_id, "renegotiation skipped in {}", record.phase());
            return Ok(None);
        }
        record.advance(NegotiationPhase::Renegotiating);

        match self.offer(peer_id, ice_restart).await {
            Ok(signal) => Ok(Some(signal)),
            Err(e) => {
                if let Some(record) = self.records.get_mut(peer_id) {
                    record.advance(NegotiationPhase::Stable);
                }
                Err(e)
            }
        }
    }

    pub async fn restart_ice(&mut self, peer_id: &str) -> Result<Option<Signal>, NegotiationError> {
        info!(peer = %peer_id, "restarting ICE");
        self.renegotiate(peer_id, true).await
    }

    /// Offerer-role records whose path is degraded, for restart after the
    /// signaling link comes back.
    pub fn degraded_offerers(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .records
            .values()
            .filter(|r| {
                r.role() == Role::Offerer
                    && r.health() == Health::Degraded
                    && !r.is_departed()
                    && !r.transport().is_up()
            })
            .map(|r| r.peer_id().to_string())
            .collect();
        out.sort();
        out
    }

    /// Substitutes the outbound track of `track.kind()` on every connection
    /// without renegotiating. Returns how many senders took the new track.
    pub async fn replace_track(&mut self, track: LocalTrack) -> usize {
        let mut replaced = 0;
        for record in self.records.values() {
            match record.connection().replace_track(&track).await {
                Ok(()) => replaced += 1,
                Err(NegotiationError::NoSender(kind)) => {
                    warn!(
                        peer = %record.peer_id(),
                        "{kind} was negotiated receive-only, new track not sent"
                    );
                }
                Err(e) => warn!(peer = %record.peer_id(), "replace_track failed: {e}"),
            }
        }
        debug!("replaced {} track on {replaced} connection(s)", track.kind());
        self.local_tracks.insert(track.kind(), track);
        replaced
    }

    /// Withdraws the local track of `kind`. Existing senders go silent
    /// without renegotiation; later peers get a receive-only transceiver.
    pub async fn clear_track(&mut self, kind: MediaKind) -> usize {
        self.local_tracks.remove(&kind);
        let mut cleared = 0;
        for record in self.records.values() {
            match record.connection().clear_track(kind).await {
                Ok(()) => cleared += 1,
                Err(NegotiationError::NoSender(_)) => {}
                Err(e) => warn!(peer = %record.peer_id(), "clear_track failed: {e}"),
            }
        }
        debug!("cleared {kind} track on {cleared} connection(s)");
        cleared
    }

    /// Translates one connection callback into session work. Events from a
    /// connection that was replaced or closed are dropped here.
    pub async fn handle_event(&mut self, event: PeerEvent) -> Vec<PeerUpdate> {
        let PeerEvent {
            peer_id,
            generation,
            kind,
        } = event;
        let current = self.records.get(&peer_id).map(PeerRecord::generation);
        if current != Some(generation) {
            debug!(
                peer = %peer_id,
                generation,
                "dropping event from superseded connection: {kind:?}"
            );
            return Vec::new();
        }

        match kind {
            PeerEventKind::LocalCandidate(candidate) => vec![PeerUpdate::Outbound {
                peer_id,
                signal: Signal::candidate(candidate),
            }],
            PeerEventKind::RemoteTrack(track) => {
                let Some(record) = self.records.get_mut(&peer_id) else {
                    return Vec::new();
                };
                info!(peer = %peer_id, "remote {} track {}", track.kind, track.id);
                record.attach_remote(track.clone());
                vec![PeerUpdate::RemoteTrack { peer_id, track }]
            }
            PeerEventKind::Transport(state) => self.on_transport(peer_id, state).await,
            PeerEventKind::RecoveryCheck => {
                self.recovery_timers.remove(&peer_id);
                match self.records.get(&peer_id) {
                    Some(r) if !r.transport().is_up() && r.role() == Role::Offerer => {
                        vec![PeerUpdate::RecoveryDue { peer_id }]
                    }
                    _ => Vec::new(),
                }
            }
        }
    }

    async fn on_transport(&mut self, peer_id: String, state: TransportState) -> Vec<PeerUpdate> {
        let Some(record) = self.records.get_mut(&peer_id) else {
            return Vec::new();
        };
        debug!(peer = %peer_id, "transport {:?} -> {:?}", record.transport(), state);
        record.set_transport(state);
        let health = record.health();
        let role = record.role();
        let departed = record.is_departed();

        match state {
            TransportState::Closed => {
                self.cancel_recovery(&peer_id);
                if let Some(mut record) = self.records.remove(&peer_id) {
                    record.advance(NegotiationPhase::Closed);
                }
                info!(peer = %peer_id, "connection closed, record removed");
                vec![PeerUpdate::Removed { peer_id }]
            }
            TransportState::Disconnected | TransportState::Failed if departed => {
                self.destroy(&peer_id).await;
                vec![PeerUpdate::Removed { peer_id }]
            }
            TransportState::Disconnected => {
                self.schedule_recovery_check(&peer_id);
                vec![PeerUpdate::Transport {
                    peer_id,
                    state,
                    health,
                }]
            }
            TransportState::Failed => {
                self.cancel_recovery(&peer_id);
                let mut updates = vec![PeerUpdate::Transport {
                    peer_id: peer_id.clone(),
                    state,
                    health,
                }];
                if role == Role::Offerer {
                    updates.push(PeerUpdate::RecoveryDue { peer_id });
                }
                updates
            }
            TransportState::Connected | TransportState::Completed => {
                if self.cancel_recovery(&peer_id) {
                    info!(peer = %peer_id, "connection recovered within grace period");
                }
                vec![PeerUpdate::Transport {
                    peer_id,
                    state,
                    health,
                }]
            }
            TransportState::New | TransportState::Checking => vec![PeerUpdate::Transport {
                peer_id,
                state,
                health,
            }],
        }
    }

    /// Arms the grace timer for a disconnected path. At most one per peer.
    fn schedule_recovery_check(&mut self, peer_id: &str) {
        if self.recovery_timers.contains_key(peer_id) {
            debug!(peer = %peer_id, "recovery check already pending");
            return;
        }
        let Some(record) = self.records.get(peer_id) else {
            return;
        };
        let sender = PeerEventSender::new(peer_id, record.generation(), self.events.clone());
        let grace = self.grace_period;
        debug!(peer = %peer_id, "grace period started, waiting {grace:?}");
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            sender.recovery_check();
        });
        self.recovery_timers.insert(peer_id.to_string(), timer);
    }

    fn cancel_recovery(&mut self, peer_id: &str) -> bool {
        match self.recovery_timers.remove(peer_id) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Closes every connection and forgets every record.
    pub async fn close_all(&mut self) -> usize {
        for (_, timer) in self.recovery_timers.drain() {
            timer.abort();
        }
        let records: Vec<PeerRecord> = self.records.drain().map(|(_, r)| r).collect();
        for record in &records {
            if let Err(e) = record.connection().close().await {
                debug!(peer = %record.peer_id(), "close failed: {e}");
            }
        }
        if !records.is_empty() {
            info!("closed {} peer connection(s)", records.len());
        }
        records.len()
    }

    async fn offer(&mut self, peer_id: &str, ice_restart: bool) -> Result<Signal, NegotiationError> {
        let connection = self
            .records
            .get(peer_id)
            .map(PeerRecord::connection)
            .ok_or_else(|| NegotiationError::stale(peer_id, "record gone"))?;
        let offer = connection.create_offer(ice_restart).await?;
        let record = self
            .records
            .get_mut(peer_id)
            .ok_or_else(|| NegotiationError::stale(peer_id, "record gone"))?;
        record.advance(NegotiationPhase::OfferSent);
        Ok(Signal::description(offer))
    }

    async fn insert_record(&mut self, peer_id: &str, role: Role) -> Result<(), NegotiationError> {
        let generation = self.bump_generation();
        let connection = self.open_connection(peer_id, generation).await?;
        info!(peer = %peer_id, ?role, generation, "peer record created");
        self.records.insert(
            peer_id.to_string(),
            PeerRecord::new(peer_id, role, connection, generation),
        );
        Ok(())
    }

    /// Replaces the connection of an existing record with a fresh one in
    /// phase `new`, taking `role`.
    async fn rebuild(&mut self, peer_id: &str, role: Role) -> Result<(), NegotiationError> {
        self.cancel_recovery(peer_id);
        let Some(previous) = self.records.remove(peer_id) else {
            return Err(NegotiationError::stale(peer_id, "record gone"));
        };
        if let Err(e) = previous.connection().close().await {
            debug!(peer = %peer_id, "closing superseded connection: {e}");
        }

        let generation = self.bump_generation();
        let connection = self.open_connection(peer_id, generation).await?;
        let mut record = PeerRecord::new(peer_id, role, connection, generation);
        record.inherit(&previous);
        debug!(peer = %peer_id, generation, "connection rebuilt");
        self.records.insert(peer_id.to_string(), record);
        Ok(())
    }

    async fn destroy(&mut self, peer_id: &str) {
        self.cancel_recovery(peer_id);
        if let Some(mut record) = self.records.remove(peer_id) {
            record.advance(NegotiationPhase::Closed);
            if let Err(e) = record.connection().close().await {
                debug!(peer = %peer_id, "close failed: {e}");
            }
            info!(peer = %peer_id, "peer record destroyed");
        }
    }

    /// Opens a connection with every current local track attached. Kinds
    /// without a local track are negotiated receive-only.
    async fn open_connection(
        &self,
        peer_id: &str,
        generation: u64,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let events = PeerEventSender::new(peer_id, generation, self.events.clone());
        let connection = self.connector.connect(peer_id, events).await?;
        if let Err(e) = self.attach_local(connection.as_ref()).await {
            let _ = connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    async fn attach_local(&self, connection: &dyn PeerConnection) -> Result<(), NegotiationError> {
        for kind in MediaKind::ALL {
            match self.local_tracks.get(&kind) {
                Some(track) => connection.add_track(track).await?,
                None => connection.receive_only(kind).await?,
            }
        }
        Ok(())
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        for (_, timer) in self.recovery_timers.drain() {
            timer.abort();
        }
    }
}

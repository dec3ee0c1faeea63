use super::handle::PeerConnection;
use super::types::{Health, NegotiationPhase, RemoteTrack, Role, TransportState};
use crate::media::MediaKind;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Remote media attached to a record, filled as tracks arrive.
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
}

impl RemoteMedia {
    fn attach(&mut self, track: RemoteTrack) {
        match track.kind {
            MediaKind::Audio => self.audio = Some(track),
            MediaKind::Video => self.video = Some(track),
        }
    }
}

/// One remote participant's connection and negotiation state.
pub struct PeerRecord {
    peer_id: String,
    display_name: Option<String>,
    role: Role,
    phase: NegotiationPhase,
    health: Health,
    transport: TransportState,
    remote_media: Option<RemoteMedia>,
    /// Relay announced `peer-left` while the media path was still up.
    departed: bool,
    /// Our own offer was dropped in a collision; its answer is still in flight.
    discarded_offer: bool,
    connection: Arc<dyn PeerConnection>,
    generation: u64,
}

impl PeerRecord {
    pub(crate) fn new(
        peer_id: &str,
        role: Role,
        connection: Arc<dyn PeerConnection>,
        generation: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: None,
            role,
            phase: NegotiationPhase::New,
            health: Health::Unknown,
            transport: TransportState::New,
            remote_media: None,
            departed: false,
            discarded_offer: false,
            connection,
            generation,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    pub fn is_departed(&self) -> bool {
        self.departed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn connection(&self) -> Arc<dyn PeerConnection> {
        self.connection.clone()
    }

    pub(crate) fn set_display_name(&mut self, name: Option<String>) {
        if name.is_some() {
            self.display_name = name;
        }
    }

    pub(crate) fn set_departed(&mut self, departed: bool) {
        self.departed = departed;
        self.health = if departed {
            Health::Degraded
        } else {
            self.transport.health().unwrap_or(Health::Unknown)
        };
    }

    pub(crate) fn discarded_offer(&self) -> bool {
        self.discarded_offer
    }

    pub(crate) fn set_discarded_offer(&mut self, discarded: bool) {
        self.discarded_offer = discarded;
    }

    /// Carries identity over from the record a rebuild replaces.
    pub(crate) fn inherit(&mut self, previous: &PeerRecord) {
        self.display_name = previous.display_name.clone();
        self.departed = previous.departed;
        self.discarded_offer = previous.discarded_offer;
    }

    /// Moves to `to` if the transition table allows it. Disallowed
    /// transitions are logged and ignored.
    pub(crate) fn advance(&mut self, to: NegotiationPhase) -> bool {
        if self.phase == to {
            return true;
        }
        if !self.phase.can_transition(to) {
            warn!(
                peer = %self.peer_id,
                "ignoring phase transition {} -> {}", self.phase, to
            );
            return false;
        }
        debug!(peer = %self.peer_id, "phase {} -> {}", self.phase, to);
        self.phase = to;
        true
    }

    pub(crate) fn set_transport(&mut self, state: TransportState) {
        self.transport = state;
        if let Some(health) = state.health() {
            self.health = if self.departed { Health::Degraded } else { health };
        }
    }

    pub(crate) fn attach_remote(&mut self, track: RemoteTrack) {
        self.remote_media
            .get_or_insert_with(RemoteMedia::default)
            .attach(track);
        if !self.departed {
            self.health = Health::Connected;
        }
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            phase: self.phase,
            health: self.health,
            transport: self.transport,
            has_remote_media: self.remote_media.is_some(),
            departed: self.departed,
        }
    }
}

/// Diagnostic copy of a record's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub phase: NegotiationPhase,
    pub health: Health,
    pub transport: TransportState,
    pub has_remote_media: bool,
    pub departed: bool,
}

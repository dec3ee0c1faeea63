//! Seam between the registry and a concrete peer connection.

use super::types::{IceCandidate, RemoteTrack, SessionDescription, TransportState};
use crate::error::NegotiationError;
use crate::media::{LocalTrack, MediaKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One direct connection to a remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates an offer and commits it as the local description.
    async fn create_offer(&self, ice_restart: bool)
        -> Result<SessionDescription, NegotiationError>;

    /// Creates an answer and commits it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Negotiate `kind` as receive-only.
    async fn receive_only(&self, kind: MediaKind) -> Result<(), NegotiationError>;

    /// Substitutes the outbound track of `track.kind()` in place.
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    /// Leaves the `kind` sender in place with no track attached.
    async fn clear_track(&self, kind: MediaKind) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds connections; callbacks report through `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    Transport(TransportState),
    RemoteTrack(RemoteTrack),
    /// Grace period after a disconnect elapsed.
    RecoveryCheck,
}

/// Callback output of one connection, tagged with the connection's
/// generation so events from a replaced connection can be told apart.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: String,
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub struct PeerEventSender {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSender {
    pub(crate) fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn transport_state(&self, state: TransportState) {
        self.emit(PeerEventKind::Transport(state));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(PeerEventKind::RemoteTrack(track));
    }

    pub(crate) fn recovery_check(&self) {
        self.emit(PeerEventKind::RecoveryCheck);
    }

    fn emit(&self, kind: PeerEventKind) {
        // The session may already be gone; late callbacks are dropped.
        let _ = self.tx.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            kind,
        });
    }
}

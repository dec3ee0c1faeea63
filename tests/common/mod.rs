#![allow(dead_code)]

use async_trait::async_trait;
use meetmesh::error::NegotiationError;
use meetmesh::media::{DeviceInfo, LocalTrack, MediaKind, SourceKind};
use meetmesh::peer::{
    IceCandidate, PeerConnection, PeerConnector, PeerEvent, PeerEventSender, PeerRegistry,
    PeerUpdate, SdpKind, SessionDescription, TransportState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    up: bool,
    offers: usize,
    ice_restarts: usize,
    candidates: Vec<IceCandidate>,
    senders: HashMap<MediaKind, Option<String>>,
    receive_only: HashSet<MediaKind>,
    closed: bool,
}

/// Scripted connection: reports `connected` whenever a negotiation round
/// completes on a path that is not already up.
pub struct FakeConnection {
    peer_id: String,
    events: PeerEventSender,
    inner: Mutex<Inner>,
}

impl FakeConnection {
    fn new(peer_id: &str, events: PeerEventSender) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            events,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn offers(&self) -> usize {
        self.inner().offers
    }

    pub fn ice_restarts(&self) -> usize {
        self.inner().ice_restarts
    }

    pub fn candidates(&self) -> usize {
        self.inner().candidates.len()
    }

    pub fn sender_device(&self, kind: MediaKind) -> Option<String> {
        self.inner().senders.get(&kind).cloned().flatten()
    }

    pub fn is_receive_only(&self, kind: MediaKind) -> bool {
        self.inner().receive_only.contains(&kind)
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Simulates an ICE state change on this connection.
    pub fn emit_transport(&self, state: TransportState) {
        self.inner().up = state.is_up();
        self.events.transport_state(state);
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host ufrag {}", self.peer_id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn complete_round(&self) {
        let came_up = {
            let mut inner = self.inner();
            let came_up = !inner.up;
            inner.up = true;
            came_up
        };
        if came_up {
            self.events.transport_state(TransportState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let n = {
            let mut inner = self.inner();
            inner.offers += 1;
            if ice_restart {
                inner.ice_restarts += 1;
            }
            inner.local = Some(SdpKind::Offer);
            inner.offers
        };
        self.events.local_candidate(self.host_candidate());
        Ok(SessionDescription::offer(format!("v=0 offer {n} to {}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        {
            let mut inner = self.inner();
            if inner.remote != Some(SdpKind::Offer) {
                return Err(NegotiationError::Rtc(webrtc::Error::ErrNoRemoteDescription));
            }
            inner.local = Some(SdpKind::Answer);
        }
        self.events.local_candidate(self.host_candidate());
        self.complete_round();
        Ok(SessionDescription::answer(format!("v=0 answer to {}", self.peer_id)))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.inner().remote = Some(desc.kind);
        if desc.kind == SdpKind::Answer {
            self.complete_round();
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.inner().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.inner().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.inner()
            .senders
            .insert(track.kind(), Some(track.device_id().to_string()));
        Ok(())
    }

    async fn receive_only(&self, kind: MediaKind) -> Result<(), NegotiationError> {
        self.inner().receive_only.insert(kind);
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let mut inner = self.inner();
        match inner.senders.get_mut(&track.kind()) {
            Some(device) => {
                *device = Some(track.device_id().to_string());
                Ok(())
            }
            None => Err(NegotiationError::NoSender(track.kind())),
        }
    }

    async fn clear_track(&self, kind: MediaKind) -> Result<(), NegotiationError> {
        match self.inner().senders.get_mut(&kind) {
            Some(device) => {
                *device = None;
                Ok(())
            }
            None => Err(NegotiationError::NoSender(kind)),
        }
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        {
            let mut inner = self.inner();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.up = false;
        }
        self.events.transport_state(TransportState::Closed);
        Ok(())
    }
}

/// Connector handing out [`FakeConnection`]s and remembering them.
#[derive(Clone, Default)]
pub struct FakeConnector {
    created: Arc<Mutex<Vec<(String, Arc<FakeConnection>)>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection opened to `peer_id`, oldest first.
    pub fn connections(&self, peer_id: &str) -> Vec<Arc<FakeConnection>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == peer_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn latest(&self, peer_id: &str) -> Arc<FakeConnection> {
        self.connections(peer_id)
            .pop()
            .unwrap_or_else(|| panic!("no connection to {peer_id}"))
    }

    pub fn total(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        peer_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let connection = Arc::new(FakeConnection::new(peer_id, events));
        self.created
            .lock()
            .unwrap()
            .push((peer_id.to_string(), connection.clone()));
        Ok(connection)
    }
}

pub fn local_track(id: &str, source: SourceKind) -> LocalTrack {
    LocalTrack::new(
        &DeviceInfo::new(id, id, source),
        Arc::new(AtomicBool::new(true)),
    )
}

pub fn camera_and_mic() -> Vec<LocalTrack> {
    vec![
        local_track("mic-1", SourceKind::Microphone),
        local_track("camera-1", SourceKind::Camera),
    ]
}

/// Feeds every queued connection event through the registry.
pub async fn pump(
    registry: &mut PeerRegistry,
    rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
) -> Vec<PeerUpdate> {
    let mut updates = Vec::new();
    while let Ok(event) = rx.try_recv() {
        updates.extend(registry.handle_event(event).await);
    }
    updates
}

pub fn init_tracing() {
    meetmesh::logger::init();
}

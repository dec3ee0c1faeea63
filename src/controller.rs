//! Session controller: one task owning the pipeline, the peer registry and
//! the signaling transport for a room.
//!
//! Everything the session reacts to (host commands, relay envelopes,
//! connection callbacks, the init watchdog) arrives on channels drained by
//! a single `select!` loop, so no two handlers ever run concurrently.

use crate::auxiliary::{
    AuxHandlers, AuxMessage, ChatPayload, HandRaisePayload, RecordingPayload, ViewModePayload,
};
use crate::config::Config;
use crate::error::{ConfigError, SessionError};
use crate::media::{LocalTrack, MediaConstraints, MediaDevices, MediaKind, MediaPipeline, MediaSnapshot};
use crate::membership::{MembershipService, NoMembership};
use crate::peer::{
    Health, JoinOutcome, PeerConnector, PeerEvent, PeerRegistry, PeerSummary, PeerUpdate,
    RtcConnector, Signal,
};
use crate::session::{Session, SessionEvent, SessionPhase, SessionSnapshot};
use crate::signaling::{
    self, Envelope, SignalingDialer, SignalingHandle, TransportEvent, UserInfo, WsDialer,
};
use std::collections::BTreeMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Collaborators a session is built from.
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub dialer: Arc<dyn SignalingDialer>,
    pub membership: Arc<dyn MembershipService>,
    pub aux: AuxHandlers,
}

impl SessionDeps {
    /// WebSocket signaling and `webrtc` peer connections as configured.
    pub fn from_config(config: &Config, devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            connector: Arc::new(RtcConnector::new(&config.ice_servers)),
            dialer: Arc::new(WsDialer::new(config.signaling_url.clone())),
            membership: Arc::new(NoMembership),
            aux: AuxHandlers::default(),
        }
    }

    pub fn new(
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        dialer: Arc<dyn SignalingDialer>,
    ) -> Self {
        Self {
            devices,
            connector,
            dialer,
            membership: Arc::new(NoMembership),
            aux: AuxHandlers::default(),
        }
    }

    pub fn with_membership(mut self, membership: Arc<dyn MembershipService>) -> Self {
        self.membership = membership;
        self
    }

    pub fn with_aux_handlers(mut self, aux: AuxHandlers) -> Self {
        self.aux = aux;
        self
    }
}

enum Command {
    SetEnabled {
        kind: MediaKind,
        enabled: bool,
    },
    SwitchDevice {
        kind: MediaKind,
        device_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StartScreenShare {
        screen_id: Option<String>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Aux(AuxMessage),
    Renegotiate(String),
    Retry,
    Peers(oneshot::Sender<Vec<PeerSummary>>),
    Media(oneshot::Sender<Option<MediaSnapshot>>),
    Leave(oneshot::Sender<()>),
}

/// Host-side handle on a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Enters `room_code`: acquires media, then connects signaling. Returns
    /// at once; progress is reported through [`SessionHandle::watch`] and
    /// [`SessionHandle::subscribe`].
    pub fn start(
        config: Config,
        room_code: &str,
        user: UserInfo,
        constraints: MediaConstraints,
        deps: SessionDeps,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::initial(room_code));
        let (commands, rx) = mpsc::unbounded_channel();

        let controller = Controller {
            session: Session::new(room_code, user),
            config,
            constraints,
            devices: deps.devices,
            connector: deps.connector,
            dialer: deps.dialer,
            membership: deps.membership,
            membership_join: None,
            aux: deps.aux,
            events: events.clone(),
            snapshot: snapshot_tx,
            pipeline: None,
            registry: None,
            peer_rx: None,
            signaling: None,
            transport_rx: None,
            init_deadline: None,
            participants: BTreeMap::new(),
            quality: Health::Connected,
        };
        let task = tokio::spawn(controller.run(rx));

        Ok(Self {
            commands,
            events,
            snapshot,
            task,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until the snapshot satisfies `pred`. `None` if the session
    /// task is gone first.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx.wait_for(pred).await.ok()?.clone();
        Some(snapshot)
    }

    /// Local mute/unmute. Never renegotiates.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        let _ = self.commands.send(Command::SetEnabled { kind, enabled });
    }

    /// Opens another device for `kind` and hands its track to every peer.
    pub async fn switch_device(&self, kind: MediaKind, device_id: &str) -> Result<(), SessionError> {
        self.request(|reply| Command::SwitchDevice {
            kind,
            device_id: device_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn start_screen_share(&self, screen_id: Option<&str>) -> Result<(), SessionError> {
        self.request(|reply| Command::StartScreenShare {
            screen_id: screen_id.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StopScreenShare { reply }).await
    }

    pub fn send_chat(&self, text: &str) {
        self.aux(AuxMessage::Chat(ChatPayload {
            text: text.to_string(),
        }));
    }

    pub fn raise_hand(&self, raised: bool) {
        self.aux(AuxMessage::HandRaise(HandRaisePayload { raised }));
    }

    pub fn announce_recording(&self, active: bool) {
        self.aux(AuxMessage::Recording(RecordingPayload { active }));
    }

    pub fn set_view_mode(&self, mode: &str) {
        self.aux(AuxMessage::ViewMode(ViewModePayload {
            mode: mode.to_string(),
        }));
    }

    /// Re-offers to `peer_id` if this side holds the offerer role.
    pub fn renegotiate(&self, peer_id: &str) {
        let _ = self.commands.send(Command::Renegotiate(peer_id.to_string()));
    }

    /// Full re-initialization; only honored in the `error` phase.
    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    /// Per-peer diagnostics, sorted by peer id.
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Peers(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn media(&self) -> Option<MediaSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Media(tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Leaves the room and releases everything.
    pub async fn leave(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            debug!("session task ended abnormally: {e}");
        }
    }

    fn aux(&self, message: AuxMessage) {
        let _ = self.commands.send(Command::Aux(message));
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::NotRunning)?;
        rx.await.unwrap_or(Err(SessionError::NotRunning))
    }
}

enum Input {
    Command(Option<Command>),
    Transport(TransportEvent),
    Peer(PeerEvent),
    InitTimeout,
}

struct Controller {
    config: Config,
    session: Session,
    constraints: MediaConstraints,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    dialer: Arc<dyn SignalingDialer>,
    membership: Arc<dyn MembershipService>,
    /// Best-effort membership join, running beside the session.
    membership_join: Option<JoinHandle<()>>,
    aux: AuxHandlers,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    pipeline: Option<MediaPipeline>,
    registry: Option<PeerRegistry>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    signaling: Option<SignalingHandle>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    init_deadline: Option<Instant>,
    /// Participants last announced to the host, with display names.
    participants: BTreeMap<String, Option<String>>,
    quality: Health,
}

async fn recv<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

fn send_relay(signaling: Option<&SignalingHandle>, code: &str, peer_id: &str, signal: Signal) {
    let Some(signaling) = signaling else {
        return;
    };
    if let Err(e) = signaling.send(Envelope::relay(code, peer_id, signal)) {
        debug!(peer = peer_id, "relay not sent: {e}");
    }
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let membership = self.membership.clone();
        let code = self.session.room_code.clone();
        let user = self.session.local.clone();
        self.membership_join = Some(tokio::spawn(async move {
            if let Err(e) = membership.join(&code, &user).await {
                warn!("membership join failed: {e}");
            }
        }));
        self.initialize().await;

        loop {
            let input = tokio::select! {
                cmd = commands.recv() => Input::Command(cmd),
                Some(ev) = recv(&mut self.transport_rx) => Input::Transport(ev),
                Some(ev) = recv(&mut self.peer_rx) => Input::Peer(ev),
                _ = deadline(self.init_deadline) => Input::InitTimeout,
            };

            match input {
                Input::Command(Some(Command::Leave(reply))) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                // handle dropped without leaving
                Input::Command(None) => {
                    self.shutdown().await;
                    return;
                }
                Input::Command(Some(cmd)) => self.on_command(cmd).await,
                Input::Transport(ev) => self.on_transport(ev).await,
                Input::Peer(ev) => self.on_peer_event(ev).await,
                Input::InitTimeout => {
                    let limit = self.config.init_timeout();
                    self.fail(SessionError::InitTimeout(limit)).await;
                }
            }
        }
    }

    /// Media first, then signaling. The watchdog covers both steps.
    async fn initialize(&mut self) {
        self.session = Session::new(&self.session.room_code, self.session.local.clone());
        let deadline = Instant::now() + self.config.init_timeout();
        self.init_deadline = Some(deadline);
        self.set_phase(SessionPhase::Initializing);

        let acquired = timeout(
            self.config.init_timeout(),
            MediaPipeline::acquire(self.devices.clone(), &self.constraints),
        )
        .await;
        let pipeline = match acquired {
            Ok(Ok(pipeline)) => pipeline,
            Ok(Err(e)) => return self.fail(SessionError::Device(e)).await,
            Err(_) => {
                let limit = self.config.init_timeout();
                return self.fail(SessionError::InitTimeout(limit)).await;
            }
        };

        let (mut registry, peer_rx) = PeerRegistry::new(
            &self.session.local.id,
            self.connector.clone(),
            self.config.grace_period(),
        );
        registry.set_local_tracks(pipeline.tracks());

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let join = Envelope::Join {
            code: self.session.room_code.clone(),
            user: self.session.local.clone(),
        };
        let handle = signaling::spawn(
            self.dialer.clone(),
            join,
            self.config.reconnect.clone(),
            transport_tx,
        );

        self.pipeline = Some(pipeline);
        self.registry = Some(registry);
        self.peer_rx = Some(peer_rx);
        self.signaling = Some(handle);
        self.transport_rx = Some(transport_rx);
        self.set_phase(SessionPhase::Connecting);
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetEnabled { kind, enabled } => match self.pipeline.as_ref() {
                Some(pipeline) => pipeline.toggle_enabled(kind, enabled),
                None => debug!("no media to toggle"),
            },
            Command::SwitchDevice {
                kind,
                device_id,
                reply,
            } => {
                let result = match self.pipeline.as_mut() {
                    Some(p) => p.switch_device(kind, &device_id).await.map(Some),
                    None => Ok(None),
                };
                let _ = reply.send(self.fan_out(result).await);
            }
            Command::StartScreenShare { screen_id, reply } => {
                let result = match self.pipeline.as_mut() {
                    Some(p) => p.start_screen_share(screen_id.as_deref()).await.map(Some),
                    None => Ok(None),
                };
                let _ = reply.send(self.fan_out(result).await);
            }
            Command::StopScreenShare { reply } => {
                let stopped = match self.pipeline.as_mut() {
                    Some(p) => {
                        let was_sharing = p.is_screen_sharing();
                        Some((was_sharing, p.stop_screen_share().await))
                    }
                    None => None,
                };
                let result = match stopped {
                    None => Err(SessionError::NotRunning),
                    Some((false, Ok(None))) => Ok(()),
                    // no camera to return to: video goes dark everywhere
                    Some((true, Ok(None))) => {
                        if let Some(registry) = self.registry.as_mut() {
                            let cleared = registry.clear_track(MediaKind::Video).await;
                            debug!("video withdrawn from {cleared} peer(s)");
                        }
                        Ok(())
                    }
                    Some((_, restored)) => self.fan_out(restored).await,
                };
                let _ = reply.send(result);
            }
            Command::Aux(message) => {
                let kind = message.kind();
                match message.into_envelope(&self.session.room_code) {
                    Ok(envelope) => match self.signaling.as_ref() {
                        Some(s) if s.is_connected() => {
                            if let Err(e) = s.send(envelope) {
                                debug!("{kind:?} not sent: {e}");
                            }
                        }
                        _ => debug!("signaling down, {kind:?} dropped"),
                    },
                    Err(e) => warn!("cannot encode {kind:?}: {e}"),
                }
            }
            Command::Renegotiate(peer_id) => {
                let Some(registry) = self.registry.as_mut() else {
                    return;
                };
                match registry.renegotiate(&peer_id, false).await {
                    Ok(Some(signal)) => send_relay(
                        self.signaling.as_ref(),
                        &self.session.room_code,
                        &peer_id,
                        signal,
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer_id, "renegotiation failed: {e}"),
                }
            }
            Command::Retry => {
                if self.session.phase == SessionPhase::Error {
                    info!("retrying session");
                    self.initialize().await;
                } else {
                    debug!("retry ignored in {}", self.session.phase);
                }
            }
            Command::Peers(reply) => {
                let peers = self
                    .registry
                    .as_ref()
                    .map(PeerRegistry::summaries)
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::Media(reply) => {
                let _ = reply.send(self.pipeline.as_ref().map(MediaPipeline::snapshot));
            }
            // the loop handles it before dispatch
            Command::Leave(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Hands a freshly opened track to every connection in place.
    async fn fan_out(
        &mut self,
        result: Result<Option<LocalTrack>, crate::error::DeviceError>,
    ) -> Result<(), SessionError> {
        match result {
            Ok(Some(track)) => {
                if let Some(registry) = self.registry.as_mut() {
                    let replaced = registry.replace_track(track).await;
                    debug!("track fan-out reached {replaced} peer(s)");
                }
                Ok(())
            }
            Ok(None) => Err(SessionError::NotRunning),
            Err(e) => {
                warn!("device action failed: {e}");
                Err(e.into())
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { reconnect } => {
                if self.session.phase == SessionPhase::Connecting {
                    self.init_deadline = None;
                    self.set_phase(SessionPhase::Active);
                }
                if reconnect {
                    info!("signaling restored");
                    self.emit(SessionEvent::SignalingRestored);
                    self.recover_degraded().await;
                }
                self.publish();
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                debug!("signaling reconnect {attempt} in {delay:?}");
                self.emit(SessionEvent::SignalingInterrupted { attempt });
                self.publish();
            }
            TransportEvent::Lost(e) => self.fail(SessionError::SignalingLost(e)).await,
            TransportEvent::Envelope(envelope) => {
                self.on_envelope(envelope).await;
                self.sync_participants();
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        if let Some(event) = self.aux.dispatch(&envelope) {
            self.emit(event);
            return;
        }

        let local_id = self.session.local.id.as_str();
        let code = self.session.room_code.as_str();
        let signaling = self.signaling.as_ref();
        let Some(registry) = self.registry.as_mut() else {
            return;
        };

        match envelope {
            Envelope::PeerRoster { peers } => {
                let peers: Vec<String> = peers.into_iter().filter(|p| p != local_id).collect();
                let created = registry.add_existing_peers(&peers).await;
                debug!("roster of {} seeded {} record(s)", peers.len(), created.len());
            }
            Envelope::PeerJoined { peer_id, user } => {
                if peer_id == local_id {
                    return;
                }
                match registry.add_joined_peer(&peer_id, user.map(|u| u.name)).await {
                    Ok(JoinOutcome::Created(offer)) => send_relay(signaling, code, &peer_id, offer),
                    Ok(JoinOutcome::Existing) => {
                        debug!(peer = %peer_id, "duplicate peer-joined ignored")
                    }
                    Err(e) => warn!(peer = %peer_id, "cannot offer to new peer: {e}"),
                }
            }
            Envelope::PeerLeft { peer_id } => {
                let departure = registry.remove_departed(&peer_id).await;
                debug!(peer = %peer_id, "peer-left: {departure:?}");
            }
            Envelope::Relay {
                from: Some(from),
                signal,
                ..
            } => match registry.handle_signal(&from, signal).await {
                Ok(Some(reply)) => send_relay(signaling, code, &from, reply),
                Ok(None) => {}
                Err(e) if e.is_stale() => debug!("{e}"),
                Err(e) => warn!(peer = %from, "negotiation failed: {e}"),
            },
            Envelope::Error { message } => warn!("relay error: {message}"),
            other => debug!("ignoring {} envelope", other.kind()),
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(registry) = self.registry.as_mut() else {
            return;
        };
        let updates = registry.handle_event(event).await;
        for update in updates {
            match update {
                PeerUpdate::Outbound { peer_id, signal } => send_relay(
                    self.signaling.as_ref(),
                    &self.session.room_code,
                    &peer_id,
                    signal,
                ),
                PeerUpdate::RemoteTrack { peer_id, track } => {
                    self.emit(SessionEvent::RemoteTrack { peer_id, track })
                }
                PeerUpdate::RecoveryDue { peer_id } => self.restart_ice(&peer_id).await,
                PeerUpdate::Transport { .. } | PeerUpdate::Removed { .. } => {}
            }
        }
        self.sync_participants();
    }

    async fn restart_ice(&mut self, peer_id: &str) {
        if !self.signaling.as_ref().is_some_and(SignalingHandle::is_connected) {
            debug!(peer = peer_id, "signaling down, ICE restart deferred");
            return;
        }
        let Some(registry) = self.registry.as_mut() else {
            return;
        };
        match registry.restart_ice(peer_id).await {
            Ok(Some(offer)) => send_relay(
                self.signaling.as_ref(),
                &self.session.room_code,
                peer_id,
                offer,
            ),
            Ok(None) => {}
            Err(e) => warn!(peer = peer_id, "ICE restart failed: {e}"),
        }
    }

    /// After signaling comes back, restart every path that degraded while
    /// no offer could be sent.
    async fn recover_degraded(&mut self) {
        let pending = self
            .registry
            .as_ref()
            .map(PeerRegistry::degraded_offerers)
            .unwrap_or_default();
        for peer_id in pending {
            self.restart_ice(&peer_id).await;
        }
    }

    async fn fail(&mut self, error: SessionError) {
        warn!("session failed: {error}");
        self.teardown(false).await;
        self.set_phase(SessionPhase::Error);
        self.emit(SessionEvent::Error(error));
    }

    async fn shutdown(&mut self) {
        self.teardown(true).await;
        if let Some(join) = self.membership_join.take() {
            join.abort();
        }
        let leave = self
            .membership
            .leave(&self.session.room_code, &self.session.local);
        match timeout(LEAVE_FLUSH_TIMEOUT, leave).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("membership leave failed: {e}"),
            Err(_) => warn!("membership leave timed out"),
        }
        self.set_phase(SessionPhase::Closed);
    }

    /// Releases records, transport and media. `graceful` announces the
    /// leave to the relay first.
    async fn teardown(&mut self, graceful: bool) {
        self.init_deadline = None;
        if let Some(signaling) = self.signaling.take() {
            if graceful && signaling.is_connected() {
                let _ = signaling.send(Envelope::Leave {
                    code: self.session.room_code.clone(),
                });
                if timeout(LEAVE_FLUSH_TIMEOUT, signaling.close()).await.is_err() {
                    debug!("signaling close timed out");
                }
            }
        }
        self.transport_rx = None;
        if let Some(mut registry) = self.registry.take() {
            registry.close_all().await;
        }
        self.peer_rx = None;
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.release();
        }
        self.sync_participants();
    }

    /// Announces joins and leaves since the last call.
    fn sync_participants(&mut self) {
        let current: BTreeMap<String, Option<String>> = self
            .registry
            .as_ref()
            .map(|r| {
                r.records()
                    .map(|rec| (rec.peer_id().to_string(), rec.display_name().map(str::to_string)))
                    .collect()
            })
            .unwrap_or_default();

        let left: Vec<String> = self
            .participants
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        let joined: Vec<(String, Option<String>)> = current
            .iter()
            .filter(|(id, _)| !self.participants.contains_key(*id))
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect();

        self.participants = current;
        for peer_id in left {
            self.emit(SessionEvent::ParticipantLeft { peer_id });
        }
        for (peer_id, display_name) in joined {
            self.emit(SessionEvent::ParticipantJoined {
                peer_id,
                display_name,
            });
        }
        self.publish();
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.session.phase != phase {
            info!("session {} -> {}", self.session.phase, phase);
            self.session.phase = phase;
        }
        self.emit(SessionEvent::PhaseChanged(phase));
        self.publish();
    }

    fn publish(&mut self) {
        let quality = self
            .registry
            .as_ref()
            .map(PeerRegistry::worst_health)
            .unwrap_or(Health::Connected);
        if quality != self.quality {
            self.quality = quality;
            self.emit(SessionEvent::QualityChanged(quality));
        }
        let snapshot = SessionSnapshot {
            room_code: self.session.room_code.clone(),
            phase: self.session.phase,
            participants: self.registry.as_ref().map_or(0, PeerRegistry::len) + 1,
            quality,
            signaling_connected: self
                .signaling
                .as_ref()
                .is_some_and(SignalingHandle::is_connected),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

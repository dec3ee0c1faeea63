mod common;

use async_trait::async_trait;
use common::FakeConnector;
use meetmesh::error::MembershipError;
use meetmesh::peer::{NegotiationPhase, Role};
use meetmesh::{
    Config, DeviceError, DeviceInfo, Health, LocalRelay, MediaConstraints, MediaKind,
    MembershipService, PeerSummary, ReconnectPolicy, SessionDeps, SessionError, SessionEvent,
    SessionHandle, SessionPhase, SessionSnapshot, SignalingError, SourceKind, UserInfo,
    VirtualDevices,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const ROOM: &str = "standup";
const WAIT: Duration = Duration::from_secs(5);

fn config() -> Config {
    Config {
        signaling_url: "local://relay".into(),
        ice_servers: Vec::new(),
        init_timeout_ms: 2_000,
        grace_period_ms: 100,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 50,
        },
    }
}

struct Participant {
    handle: SessionHandle,
    connector: FakeConnector,
    devices: VirtualDevices,
}

fn start_with(
    relay: &LocalRelay,
    id: &str,
    devices: VirtualDevices,
    config: Config,
) -> Participant {
    launch(relay, id, devices, config, MediaConstraints::default(), |deps| deps)
}

fn launch(
    relay: &LocalRelay,
    id: &str,
    devices: VirtualDevices,
    config: Config,
    constraints: MediaConstraints,
    customize: impl FnOnce(SessionDeps) -> SessionDeps,
) -> Participant {
    common::init_tracing();
    let connector = FakeConnector::new();
    let deps = customize(SessionDeps::new(
        Arc::new(devices.clone()),
        Arc::new(connector.clone()),
        relay.dialer(),
    ));
    let handle = SessionHandle::start(
        config,
        ROOM,
        UserInfo::new(id, id.to_uppercase()),
        constraints,
        deps,
    )
    .unwrap();
    Participant {
        handle,
        connector,
        devices,
    }
}

async fn join(relay: &LocalRelay, id: &str) -> Participant {
    let p = start_with(relay, id, VirtualDevices::new(), config());
    phase(&p.handle, SessionPhase::Active).await;
    p
}

async fn phase(handle: &SessionHandle, phase: SessionPhase) -> SessionSnapshot {
    timeout(WAIT, handle.wait_for(|s| s.phase == phase))
        .await
        .unwrap_or_else(|_| panic!("session never reached {phase}"))
        .expect("session task gone")
}

async fn peers_until(
    handle: &SessionHandle,
    pred: impl Fn(&[PeerSummary]) -> bool,
) -> Vec<PeerSummary> {
    timeout(WAIT, async {
        loop {
            let peers = handle.peers().await;
            if pred(&peers) {
                return peers;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers never settled")
}

fn all_connected(n: usize) -> impl Fn(&[PeerSummary]) -> bool {
    move |peers| {
        peers.len() == n
            && peers
                .iter()
                .all(|p| p.phase == NegotiationPhase::Stable && p.health == Health::Connected)
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test]
async fn two_participants_connect() {
    let relay = LocalRelay::new();
    let alice = join(&relay, "alice").await;
    let mut alice_events = alice.handle.subscribe();
    let bob = join(&relay, "bob").await;

    let seen = alice_events_joined(&mut alice_events).await;
    assert_eq!(seen, ("bob".to_string(), Some("BOB".to_string())));

    let at_alice = peers_until(&alice.handle, all_connected(1)).await;
    let at_bob = peers_until(&bob.handle, all_connected(1)).await;
    assert_eq!(at_alice[0].peer_id, "bob");
    assert_eq!(at_alice[0].role, Role::Offerer);
    assert_eq!(at_bob[0].peer_id, "alice");
    assert_eq!(at_bob[0].role, Role::Answerer);

    let snapshot = alice.handle.snapshot();
    assert_eq!(snapshot.participants, 2);
    assert_eq!(snapshot.quality, Health::Connected);
    assert!(snapshot.signaling_connected);
    assert_eq!(relay.members(ROOM), vec!["alice", "bob"]);

    alice.handle.leave().await;
    assert_eq!(alice.devices.active_captures(), 0);
    assert_eq!(relay.members(ROOM), vec!["bob"]);

    // media path still up from bob's side: the record waits as departed
    let at_bob = peers_until(&bob.handle, |p| p.len() == 1 && p[0].departed).await;
    assert_eq!(at_bob[0].health, Health::Degraded);
    bob.handle.leave().await;
    assert!(relay.members(ROOM).is_empty());
}

async fn alice_events_joined(
    events: &mut broadcast::Receiver<SessionEvent>,
) -> (String, Option<String>) {
    match next_event(events, |e| matches!(e, SessionEvent::ParticipantJoined { .. })).await {
        SessionEvent::ParticipantJoined {
            peer_id,
            display_name,
        } => (peer_id, display_name),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn three_participants_form_a_full_mesh() {
    let relay = LocalRelay::new();
    let alice = join(&relay, "alice").await;
    let bob = join(&relay, "bob").await;
    peers_until(&bob.handle, all_connected(1)).await;
    let carol = join(&relay, "carol").await;

    let at_alice = peers_until(&alice.handle, all_connected(2)).await;
    let at_bob = peers_until(&bob.handle, all_connected(2)).await;
    let at_carol = peers_until(&carol.handle, all_connected(2)).await;

    let role = |peers: &[PeerSummary], id: &str| {
        peers.iter().find(|p| p.peer_id == id).map(|p| p.role)
    };
    // exactly one offerer per pair: the member already in the room
    assert_eq!(role(&at_alice, "bob"), Some(Role::Offerer));
    assert_eq!(role(&at_alice, "carol"), Some(Role::Offerer));
    assert_eq!(role(&at_bob, "alice"), Some(Role::Answerer));
    assert_eq!(role(&at_bob, "carol"), Some(Role::Offerer));
    assert_eq!(role(&at_carol, "alice"), Some(Role::Answerer));
    assert_eq!(role(&at_carol, "bob"), Some(Role::Answerer));

    for p in [&alice, &bob, &carol] {
        assert_eq!(p.handle.snapshot().participants, 3);
        assert_eq!(p.connector.total(), 2);
    }

    for p in [alice, bob, carol] {
        p.handle.leave().await;
    }
}

#[tokio::test]
async fn muting_never_renegotiates() {
    let relay = LocalRelay::new();
    let alice = join(&relay, "alice").await;
    let bob = join(&relay, "bob").await;
    peers_until(&alice.handle, all_connected(1)).await;

    alice.handle.set_enabled(MediaKind::Video, false);
    alice.handle.set_enabled(MediaKind::Audio, false);
    let media = alice.handle.media().await.unwrap();
    assert!(!media.video_enabled);
    assert!(!media.audio_enabled);

    alice.handle.set_enabled(MediaKind::Audio, true);
    let media = alice.handle.media().await.unwrap();
    assert!(media.audio_enabled);

    assert_eq!(alice.connector.latest("bob").offers(), 1);
    let peers = alice.handle.peers().await;
    assert_eq!(peers[0].phase, NegotiationPhase::Stable);

    alice.handle.leave().await;
    bob.handle.leave().await;
}

#[tokio::test]
async fn device_switch_reaches_every_peer_in_place() {
    let relay = LocalRelay::new();
    let devices = VirtualDevices::new().with_device(DeviceInfo::new(
        "camera-2",
        "Second Camera",
        SourceKind::Camera,
    ));
    let alice = start_with(&relay, "alice", devices, config());
    phase(&alice.handle, SessionPhase::Active).await;
    let bob = join(&relay, "bob").await;
    let carol = join(&relay, "carol").await;
    peers_until(&alice.handle, all_connected(2)).await;

    alice
        .handle
        .switch_device(MediaKind::Video, "camera-2")
        .await
        .unwrap();
    for peer in ["bob", "carol"] {
        let conn = alice.connector.latest(peer);
        assert_eq!(conn.sender_device(MediaKind::Video).as_deref(), Some("camera-2"));
        assert_eq!(conn.offers(), 1);
    }
    let media = alice.handle.media().await.unwrap();
    assert_eq!(media.video_device.as_deref(), Some("camera-2"));

    alice.handle.start_screen_share(None).await.unwrap();
    assert_eq!(
        alice.connector.latest("bob").sender_device(MediaKind::Video).as_deref(),
        Some("virtual-screen")
    );
    alice.handle.stop_screen_share().await.unwrap();
    assert_eq!(
        alice.connector.latest("carol").sender_device(MediaKind::Video).as_deref(),
        Some("camera-2")
    );
    assert!(!alice.handle.media().await.unwrap().screen_sharing);

    let missing = alice
        .handle
        .switch_device(MediaKind::Video, "camera-9")
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        SessionError::Device(DeviceError::NotFound { .. })
    ));
    let peers = alice.handle.peers().await;
    assert!(peers.iter().all(|p| p.phase == NegotiationPhase::Stable));

    for p in [alice, bob, carol] {
        p.handle.leave().await;
    }
}

#[tokio::test]
async fn ending_a_share_without_a_camera_withdraws_video() {
    let relay = LocalRelay::new();
    let alice = launch(
        &relay,
        "alice",
        VirtualDevices::new(),
        config(),
        MediaConstraints::audio_only(),
        |deps| deps,
    );
    phase(&alice.handle, SessionPhase::Active).await;

    alice.handle.start_screen_share(None).await.unwrap();
    let bob = join(&relay, "bob").await;
    peers_until(&alice.handle, all_connected(1)).await;
    let to_bob = alice.connector.latest("bob");
    assert_eq!(
        to_bob.sender_device(MediaKind::Video).as_deref(),
        Some("virtual-screen")
    );

    alice.handle.stop_screen_share().await.unwrap();
    let media = alice.handle.media().await.unwrap();
    assert_eq!(media.video_device, None);
    assert!(!media.screen_sharing);
    assert_eq!(to_bob.sender_device(MediaKind::Video), None);
    assert_eq!(to_bob.offers(), 1);

    let carol = join(&relay, "carol").await;
    peers_until(&alice.handle, all_connected(2)).await;
    let to_carol = alice.connector.latest("carol");
    assert!(to_carol.is_receive_only(MediaKind::Video));
    assert_eq!(to_carol.sender_device(MediaKind::Video), None);

    for p in [alice, bob, carol] {
        p.handle.leave().await;
    }
}

/// Never answers `join`; records whether `leave` was attempted.
#[derive(Default)]
struct StalledMembership {
    left: AtomicBool,
}

#[async_trait]
impl MembershipService for StalledMembership {
    async fn join(&self, _room_code: &str, _user: &UserInfo) -> Result<(), MembershipError> {
        std::future::pending().await
    }

    async fn leave(&self, _room_code: &str, _user: &UserInfo) -> Result<(), MembershipError> {
        self.left.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn stalled_membership_service_does_not_block_the_session() {
    let relay = LocalRelay::new();
    let membership = Arc::new(StalledMembership::default());
    let config = Config {
        init_timeout_ms: 500,
        ..config()
    };
    let alice = launch(
        &relay,
        "alice",
        VirtualDevices::new(),
        config,
        MediaConstraints::default(),
        |deps| deps.with_membership(membership.clone()),
    );

    phase(&alice.handle, SessionPhase::Active).await;
    // well past the init watchdog
    sleep(Duration::from_millis(700)).await;
    assert_eq!(alice.handle.snapshot().phase, SessionPhase::Active);
    assert_eq!(relay.members(ROOM), vec!["alice"]);

    timeout(WAIT, alice.handle.leave())
        .await
        .expect("leave never completed");
    assert!(membership.left.load(Ordering::SeqCst));
    assert!(relay.members(ROOM).is_empty());
}

#[tokio::test]
async fn reconnecting_member_keeps_a_single_record() {
    let relay = LocalRelay::new();
    let alice = join(&relay, "alice").await;
    let bob = join(&relay, "bob").await;
    peers_until(&alice.handle, all_connected(1)).await;
    peers_until(&bob.handle, all_connected(1)).await;

    let mut bob_events = bob.handle.subscribe();
    assert!(relay.kick("bob"));

    next_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::SignalingInterrupted { .. })
    })
    .await;
    next_event(&mut bob_events, |e| matches!(e, SessionEvent::SignalingRestored)).await;

    let at_alice = peers_until(&alice.handle, |p| p.len() == 1 && !p[0].departed).await;
    assert_eq!(at_alice[0].peer_id, "bob");
    assert_eq!(at_alice[0].phase, NegotiationPhase::Stable);
    assert_eq!(alice.connector.connections("bob").len(), 1);
    assert_eq!(bob.connector.connections("alice").len(), 1);
    assert_eq!(relay.members(ROOM), vec!["alice", "bob"]);
    assert_eq!(bob.handle.snapshot().phase, SessionPhase::Active);

    alice.handle.leave().await;
    bob.handle.leave().await;
}

#[tokio::test]
async fn relay_outage_ends_in_error_until_retry() {
    let relay = LocalRelay::new();
    let alice = join(&relay, "alice").await;
    let mut events = alice.handle.subscribe();

    relay.set_online(false);
    let error = next_event(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(
        error,
        SessionEvent::Error(SessionError::SignalingLost(SignalingError::Exhausted {
            attempts: 3
        }))
    ));
    let snapshot = phase(&alice.handle, SessionPhase::Error).await;
    assert!(!snapshot.signaling_connected);
    assert_eq!(alice.devices.active_captures(), 0);
    assert_eq!(
        alice
            .handle
            .switch_device(MediaKind::Audio, "virtual-mic")
            .await,
        Err(SessionError::NotRunning)
    );

    relay.set_online(true);
    alice.handle.retry();
    phase(&alice.handle, SessionPhase::Active).await;
    assert_eq!(alice.devices.active_captures(), 2);
    assert_eq!(relay.members(ROOM), vec!["alice"]);

    alice.handle.leave().await;
}

#[tokio::test]
async fn unreachable_relay_hits_the_init_timeout() {
    let relay = LocalRelay::new();
    relay.set_online(false);
    let config = Config {
        init_timeout_ms: 200,
        reconnect: ReconnectPolicy {
            max_attempts: 100,
            base_delay_ms: 50,
            max_delay_ms: 50,
        },
        ..config()
    };
    let alice = start_with(&relay, "alice", VirtualDevices::new(), config);
    let mut events = alice.handle.subscribe();

    let error = next_event(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(
        error,
        SessionEvent::Error(SessionError::InitTimeout(d)) if d == Duration::from_millis(200)
    ));
    assert_eq!(alice.handle.snapshot().phase, SessionPhase::Error);
    assert_eq!(alice.devices.active_captures(), 0);
    alice.handle.leave().await;
}

#[tokio::test]
async fn denied_camera_fails_the_session() {
    let relay = LocalRelay::new();
    let devices = VirtualDevices::new().deny(SourceKind::Camera);
    let alice = start_with(&relay, "alice", devices, config());

    phase(&alice.handle, SessionPhase::Error).await;
    assert_eq!(alice.devices.active_captures(), 0);
    assert!(relay.members(ROOM).is_empty());
    assert!(alice.handle.media().await.is_none());
    alice.handle.leave().await;
}

#[tokio::test]
async fn chat_and_hand_raise_reach_other_members() {
    let relay = LocalRelay::new();
    let alice = join(&relay, "alice").await;
    let bob = join(&relay, "bob").await;
    let mut bob_events = bob.handle.subscribe();

    alice.handle.send_chat("hello room");
    alice.handle.raise_hand(true);

    match next_event(&mut bob_events, |e| matches!(e, SessionEvent::Chat { .. })).await {
        SessionEvent::Chat { from, text } => {
            assert_eq!(from, "alice");
            assert_eq!(text, "hello room");
        }
        other => panic!("unexpected {other:?}"),
    }
    match next_event(&mut bob_events, |e| matches!(e, SessionEvent::HandRaised { .. })).await {
        SessionEvent::HandRaised { from, raised } => {
            assert_eq!(from, "alice");
            assert!(raised);
        }
        other => panic!("unexpected {other:?}"),
    }

    alice.handle.leave().await;
    bob.handle.leave().await;
}

use super::handle::{PeerConnection, PeerConnector, PeerEventSender};
use super::ice::CandidateTally;
use super::types::{IceCandidate, RemoteTrack, SdpKind, SessionDescription, TransportState};
use crate::config::ServerConfig;
use crate::error::NegotiationError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, MediaKind};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

/// Builds `webrtc` peer connections for the mesh.
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(servers: &[ServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers(servers),
        }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// Maps host-supplied entries to `RTCIceServer`s, adding URL schemes.
pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);
        attach_handlers(&pc, peer_id, events);
        debug!(peer = peer_id, "peer connection created");

        Ok(Arc::new(RtcConnection {
            peer_id: peer_id.to_string(),
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, peer_id: &str, events: PeerEventSender) {
    let ev = events.clone();
    let peer = peer_id.to_string();
    let mut tally = CandidateTally::default();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                dump_candidate(&peer, &c);
                match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        tally.record(&candidate);
                        ev.local_candidate(candidate);
                    }
                    Err(e) => warn!(peer = %peer, "cannot serialize candidate: {e}"),
                }
            }
            // end of gathering
            None => tally.report(&peer),
        }
        Box::pin(async {})
    }));

    // Weak: the connection owns its handlers.
    let ev = events.clone();
    let peer = peer_id.to_string();
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        let state = TransportState::from(st);
        debug!(peer = %peer, "ICE connection state changed to: {st:?}");
        ev.transport_state(state);

        let peer = peer.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if matches!(state, TransportState::Disconnected | TransportState::Failed) {
                if let Some(pc) = weak.upgrade() {
                    dump_selected_pair(&pc, &peer, "BEFORE-FAIL").await;
                }
            }
        })
    }));

    let ev = events;
    let peer = peer_id.to_string();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        };
        match kind {
            Some(kind) => ev.remote_track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                source: Some(track),
            }),
            None => warn!(peer = %peer, "ignoring remote track of kind {}", track.kind()),
        }
        Box::pin(async {})
    }));
}

/// A live `RTCPeerConnection` plus the outbound sender per media kind.
pub struct RtcConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

impl RtcConnection {
    async fn local_description(&self, kind: SdpKind) -> Result<SessionDescription, NegotiationError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| NegotiationError::stale(&self.peer_id, "local description missing"))?;
        Ok(SessionDescription { kind, sdp: desc.sdp })
    }
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self.pc.add_track(track.rtc_track()).await?;

        // RTCP has to be drained for interceptors (NACK, reports) to run.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move { while rtcp_sender.read_rtcp().await.is_ok() {} });

        self.senders.lock().await.insert(track.kind(), sender);
        Ok(())
    }

    async fn receive_only(&self, kind: MediaKind) -> Result<(), NegotiationError> {
        let codec = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(
                codec,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&track.kind())
            .cloned()
            .ok_or(NegotiationError::NoSender(track.kind()))?;
        sender.replace_track(Some(track.rtc_track())).await?;
        Ok(())
    }

    async fn clear_track(&self, kind: MediaKind) -> Result<(), NegotiationError> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&kind)
            .cloned()
            .ok_or(NegotiationError::NoSender(kind))?;
        sender.replace_track(None).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        info!(peer = %self.peer_id, "closing peer connection");
        self.senders.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

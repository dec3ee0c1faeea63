use crate::media::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::track::track_remote::TrackRemote;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP offer or answer as carried in a relay envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for a relay envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Negotiation payload of a `relay` envelope: exactly one of the two is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Signal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl Signal {
    pub fn description(desc: SessionDescription) -> Self {
        Self {
            sdp: Some(desc),
            candidate: None,
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            sdp: None,
            candidate: Some(candidate),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

/// Per-peer negotiation state machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    New,
    OfferSent,
    OfferReceived,
    Stable,
    Renegotiating,
    Closed,
}

impl NegotiationPhase {
    pub fn can_transition(self, to: NegotiationPhase) -> bool {
        use NegotiationPhase::*;
        matches!(
            (self, to),
            (New, OfferSent)
                | (New, OfferReceived)
                | (OfferSent, Stable)
                | (OfferReceived, Stable)
                | (Stable, Renegotiating)
                | (Stable, OfferReceived)
                | (Renegotiating, OfferSent)
                | (Renegotiating, Stable)
        ) || (to == Closed && self != Closed)
    }

    /// Phases in which an incoming offer can be applied to the existing
    /// connection; anything else is a conflict.
    pub fn accepts_offer(self) -> bool {
        matches!(self, NegotiationPhase::New | NegotiationPhase::Stable)
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationPhase::New => "new",
            NegotiationPhase::OfferSent => "offer-sent",
            NegotiationPhase::OfferReceived => "offer-received",
            NegotiationPhase::Stable => "stable",
            NegotiationPhase::Renegotiating => "renegotiating",
            NegotiationPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// ICE transport state, independent of the negotiation phase.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Health this state maps to; `None` for the terminal `closed`.
    pub fn health(self) -> Option<Health> {
        match self {
            TransportState::New | TransportState::Checking => Some(Health::Unknown),
            TransportState::Connected | TransportState::Completed => Some(Health::Connected),
            TransportState::Disconnected | TransportState::Failed => Some(Health::Degraded),
            TransportState::Closed => None,
        }
    }

    pub fn is_up(self) -> bool {
        matches!(self, TransportState::Connected | TransportState::Completed)
    }
}

impl From<RTCIceConnectionState> for TransportState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => TransportState::Checking,
            RTCIceConnectionState::Connected => TransportState::Connected,
            RTCIceConnectionState::Completed => TransportState::Completed,
            RTCIceConnectionState::Disconnected => TransportState::Disconnected,
            RTCIceConnectionState::Failed => TransportState::Failed,
            RTCIceConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

/// Coarse link health. Ordered from best to worst.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Connected,
    Unknown,
    Degraded,
}

/// Media received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Live RTP source; absent for tracks that did not come from a real
    /// peer connection.
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("live", &self.source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_table() {
        use NegotiationPhase::*;
        assert!(New.can_transition(OfferSent));
        assert!(New.can_transition(OfferReceived));
        assert!(OfferSent.can_transition(Stable));
        assert!(Stable.can_transition(Renegotiating));
        assert!(Renegotiating.can_transition(OfferSent));
        assert!(Stable.can_transition(Closed));

        assert!(!New.can_transition(Stable));
        assert!(!OfferSent.can_transition(OfferReceived));
        assert!(!Closed.can_transition(New));
        assert!(!Closed.can_transition(Closed));
    }

    #[test]
    fn only_fresh_or_stable_accept_offers() {
        use NegotiationPhase::*;
        assert!(New.accepts_offer());
        assert!(Stable.accepts_offer());
        assert!(!OfferSent.accepts_offer());
        assert!(!Renegotiating.accepts_offer());
        assert!(!OfferReceived.accepts_offer());
    }

    #[test]
    fn transport_health_mapping() {
        assert_eq!(TransportState::Checking.health(), Some(Health::Unknown));
        assert_eq!(TransportState::Completed.health(), Some(Health::Connected));
        assert_eq!(TransportState::Failed.health(), Some(Health::Degraded));
        assert_eq!(TransportState::Closed.health(), None);
        assert!(Health::Degraded > Health::Unknown);
        assert!(Health::Unknown > Health::Connected);
    }

    #[test]
    fn signal_wire_shape() {
        let signal = Signal::description(SessionDescription::offer("v=0"));
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json, serde_json::json!({"sdp": {"type": "offer", "sdp": "v=0"}}));

        let candidate: Signal = serde_json::from_value(serde_json::json!({
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        let c = candidate.candidate.unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
    }
}

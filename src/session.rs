//! Session entity and the observables exposed to the host.

use crate::error::SessionError;
use crate::peer::types::{Health, RemoteTrack};
use crate::signaling::UserInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Acquiring local media.
    Initializing,
    /// Signaling handshake in flight.
    Connecting,
    Active,
    /// Fatal; only an explicit retry leaves it.
    Error,
    /// Left by the user.
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Initializing => "initializing",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Active => "active",
            SessionPhase::Error => "error",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One meeting attempt. Replaced wholesale by a retry.
#[derive(Debug, Clone)]
pub struct Session {
    pub room_code: String,
    pub local: UserInfo,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(room_code: &str, local: UserInfo) -> Self {
        Self {
            room_code: room_code.to_string(),
            local,
            phase: SessionPhase::Initializing,
            started_at: Utc::now(),
        }
    }
}

/// Aggregate state for the UI. Negotiation detail stays internal.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub room_code: String,
    pub phase: SessionPhase,
    /// Remote records plus the local participant.
    pub participants: usize,
    pub quality: Health,
    pub signaling_connected: bool,
}

impl SessionSnapshot {
    pub(crate) fn initial(room_code: &str) -> Self {
        Self {
            room_code: room_code.to_string(),
            phase: SessionPhase::Initializing,
            participants: 1,
            quality: Health::Connected,
            signaling_connected: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    ParticipantJoined {
        peer_id: String,
        display_name: Option<String>,
    },
    ParticipantLeft {
        peer_id: String,
    },
    RemoteTrack {
        peer_id: String,
        track: RemoteTrack,
    },
    QualityChanged(Health),
    SignalingInterrupted {
        attempt: u32,
    },
    SignalingRestored,
    Chat {
        from: String,
        text: String,
    },
    HandRaised {
        from: String,
        raised: bool,
    },
    RecordingChanged {
        from: String,
        active: bool,
    },
    ViewModeChanged {
        from: String,
        mode: String,
    },
    Error(SessionError),
}

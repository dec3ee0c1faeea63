use crate::error::SignalingError;
use crate::peer::types::Signal;
use crate::utils::random_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity announced in `join` and echoed in `peer-joined`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "participant".into()
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            role: default_role(),
        }
    }

    /// Identity with a fresh random id, for hosts without their own.
    pub fn guest(name: impl Into<String>) -> Self {
        Self::new(random_id(), name)
    }
}

/// Body shared by the best-effort broadcast kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuxBody {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// One message on the signaling channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Join {
        code: String,
        user: UserInfo,
    },
    Leave {
        code: String,
    },
    PeerRoster {
        peers: Vec<String>,
    },
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserInfo>,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Relay {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        signal: Signal,
    },
    Chat(AuxBody),
    HandRaise(AuxBody),
    Recording(AuxBody),
    ViewMode(AuxBody),
    Error {
        message: String,
    },
    /// Any type this client does not know; ignored.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn relay(code: &str, to: &str, signal: Signal) -> Self {
        Envelope::Relay {
            code: code.to_string(),
            to: Some(to.to_string()),
            from: None,
            signal,
        }
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the envelope type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Join { .. } => "join",
            Envelope::Leave { .. } => "leave",
            Envelope::PeerRoster { .. } => "peer-roster",
            Envelope::PeerJoined { .. } => "peer-joined",
            Envelope::PeerLeft { .. } => "peer-left",
            Envelope::Relay { .. } => "relay",
            Envelope::Chat(_) => "chat",
            Envelope::HandRaise(_) => "hand-raise",
            Envelope::Recording(_) => "recording",
            Envelope::ViewMode(_) => "view-mode",
            Envelope::Error { .. } => "error",
            Envelope::Unknown => "unknown",
        }
    }
}

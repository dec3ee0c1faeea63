//! Error types, one enum per failure class.
//!
//! Only [`SessionError`] ever reaches the host. Device and signaling
//! failures are wrapped into it when they become session-fatal;
//! negotiation failures stay inside the peer registry.

use crate::media::{MediaKind, SourceKind};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission denied for {0}")]
    PermissionDenied(SourceKind),

    #[error("no {kind} device matches '{wanted}'")]
    NotFound { kind: MediaKind, wanted: String },

    #[error("capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    #[error("signaling link closed abnormally: {0}")]
    AbnormalClose(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("connection lost after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },

    #[error("signaling transport is closed")]
    Closed,
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    #[error("no outbound sender for {0}")]
    NoSender(MediaKind),

    #[error("stale signal from {peer_id}: {reason}")]
    Stale { peer_id: String, reason: String },
}

impl NegotiationError {
    pub fn stale(peer_id: &str, reason: impl Into<String>) -> Self {
        Self::Stale {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("membership service: {0}")]
pub struct MembershipError(pub String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    SignalingLost(#[from] SignalingError),

    #[error("session did not become active within {0:?}")]
    InitTimeout(Duration),

    #[error("session is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

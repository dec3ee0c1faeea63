//! Best-effort broadcast messages sharing the signaling channel.
//!
//! These never touch peer records. Each kind has its own decoder in
//! [`AuxHandlers`]; a malformed payload is dropped with a warning.

use crate::session::SessionEvent;
use crate::signaling::{AuxBody, Envelope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxKind {
    Chat,
    HandRaise,
    Recording,
    ViewMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandRaisePayload {
    pub raised: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordingPayload {
    pub active: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ViewModePayload {
    pub mode: String,
}

/// Outbound auxiliary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxMessage {
    Chat(ChatPayload),
    HandRaise(HandRaisePayload),
    Recording(RecordingPayload),
    ViewMode(ViewModePayload),
}

impl AuxMessage {
    pub fn kind(&self) -> AuxKind {
        match self {
            AuxMessage::Chat(_) => AuxKind::Chat,
            AuxMessage::HandRaise(_) => AuxKind::HandRaise,
            AuxMessage::Recording(_) => AuxKind::Recording,
            AuxMessage::ViewMode(_) => AuxKind::ViewMode,
        }
    }

    pub fn into_envelope(self, code: &str) -> Result<Envelope, serde_json::Error> {
        let payload = match &self {
            AuxMessage::Chat(p) => serde_json::to_value(p)?,
            AuxMessage::HandRaise(p) => serde_json::to_value(p)?,
            AuxMessage::Recording(p) => serde_json::to_value(p)?,
            AuxMessage::ViewMode(p) => serde_json::to_value(p)?,
        };
        let body = AuxBody {
            code: code.to_string(),
            from: None,
            payload,
        };
        Ok(match self.kind() {
            AuxKind::Chat => Envelope::Chat(body),
            AuxKind::HandRaise => Envelope::HandRaise(body),
            AuxKind::Recording => Envelope::Recording(body),
            AuxKind::ViewMode => Envelope::ViewMode(body),
        })
    }
}

type Handler = Box<dyn Fn(&str, &Value) -> Option<SessionEvent> + Send + Sync>;

/// Decoders from inbound auxiliary envelopes to session events.
pub struct AuxHandlers {
    table: HashMap<AuxKind, Handler>,
}

impl Default for AuxHandlers {
    fn default() -> Self {
        let mut handlers = Self {
            table: HashMap::new(),
        };
        handlers.register(AuxKind::Chat, |from, payload| {
            typed::<ChatPayload>(AuxKind::Chat, payload).map(|p| SessionEvent::Chat {
                from: from.to_string(),
                text: p.text,
            })
        });
        handlers.register(AuxKind::HandRaise, |from, payload| {
            typed::<HandRaisePayload>(AuxKind::HandRaise, payload).map(|p| {
                SessionEvent::HandRaised {
                    from: from.to_string(),
                    raised: p.raised,
                }
            })
        });
        handlers.register(AuxKind::Recording, |from, payload| {
            typed::<RecordingPayload>(AuxKind::Recording, payload).map(|p| {
                SessionEvent::RecordingChanged {
                    from: from.to_string(),
                    active: p.active,
                }
            })
        });
        handlers.register(AuxKind::ViewMode, |from, payload| {
            typed::<ViewModePayload>(AuxKind::ViewMode, payload).map(|p| {
                SessionEvent::ViewModeChanged {
                    from: from.to_string(),
                    mode: p.mode,
                }
            })
        });
        handlers
    }
}

impl AuxHandlers {
    /// Replaces the handler for `kind`.
    pub fn register<F>(&mut self, kind: AuxKind, handler: F)
    where
        F: Fn(&str, &Value) -> Option<SessionEvent> + Send + Sync + 'static,
    {
        self.table.insert(kind, Box::new(handler));
    }

    /// Decodes an inbound envelope. Non-auxiliary envelopes, envelopes
    /// without a sender and malformed payloads yield `None`.
    pub fn dispatch(&self, envelope: &Envelope) -> Option<SessionEvent> {
        let (kind, body) = match envelope {
            Envelope::Chat(b) => (AuxKind::Chat, b),
            Envelope::HandRaise(b) => (AuxKind::HandRaise, b),
            Envelope::Recording(b) => (AuxKind::Recording, b),
            Envelope::ViewMode(b) => (AuxKind::ViewMode, b),
            _ => return None,
        };
        let Some(from) = body.from.as_deref() else {
            warn!("{kind:?} without sender dropped");
            return None;
        };
        self.table.get(&kind).and_then(|h| h(from, &body.payload))
    }
}

fn typed<T: DeserializeOwned>(kind: AuxKind, payload: &Value) -> Option<T> {
    match T::deserialize(payload) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("malformed {kind:?} payload dropped: {e}");
            None
        }
    }
}

//! In-process signaling relay.
//!
//! Rooms keyed by code; `peer-roster` to the joiner, `peer-joined` to the
//! rest; `relay` forwarded point to point with `from` stamped; auxiliary
//! kinds broadcast to everyone but the sender; `peer-left` when a member
//! leaves or its link goes away.

use super::envelope::{AuxBody, Envelope, UserInfo};
use super::transport::{SignalingDialer, SignalingLink};
use crate::error::SignalingError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<Mutex<RelayState>>,
}

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    /// (room code, peer id) once `join` was received.
    joined: Option<(String, String)>,
}

struct RelayState {
    online: bool,
    next_id: u64,
    connections: HashMap<u64, Connection>,
    /// Room code -> member peer ids in join order.
    rooms: HashMap<String, Vec<String>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayState {
                online: true,
                next_id: 1,
                connections: HashMap::new(),
                rooms: HashMap::new(),
            })),
        }
    }

    pub fn dialer(&self) -> Arc<dyn SignalingDialer> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Member ids of `code` in join order.
    pub fn members(&self, code: &str) -> Vec<String> {
        self.lock().rooms.get(code).cloned().unwrap_or_default()
    }

    /// Drops the link of `peer_id` as if its network went away.
    pub fn kick(&self, peer_id: &str) -> bool {
        let mut state = self.lock();
        let Some(id) = state.connection_of(peer_id) else {
            return false;
        };
        info!(peer = peer_id, "relay: kicking member");
        state.disconnect(id);
        true
    }

    /// Offline drops every link and refuses new dials.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            info!("relay: going offline");
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            for id in ids {
                state.disconnect(id);
            }
        }
    }
}

#[async_trait]
impl SignalingDialer for LocalRelay {
    async fn dial(&self) -> Result<Box<dyn SignalingLink>, SignalingError> {
        let mut state = self.lock();
        if !state.online {
            return Err(SignalingError::Unreachable("local relay is offline".into()));
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(id, Connection { tx, joined: None });
        debug!(conn = id, "relay: link opened");
        Ok(Box::new(RelayLink {
            relay: self.clone(),
            id,
            rx,
            open: true,
        }))
    }
}

impl RelayState {
    fn connection_of(&self, peer_id: &str) -> Option<u64> {
        self.connections.iter().find_map(|(id, c)| match &c.joined {
            Some((_, p)) if p == peer_id => Some(*id),
            _ => None,
        })
    }

    fn deliver(&self, code: &str, peer_id: &str, envelope: &Envelope) {
        let Some(id) = self.connections.iter().find_map(|(id, c)| match &c.joined {
            Some((room, p)) if room == code && p == peer_id => Some(*id),
            _ => None,
        }) else {
            return;
        };
        match envelope.encode() {
            Ok(text) => {
                if let Some(conn) = self.connections.get(&id) {
                    let _ = conn.tx.send(text);
                }
            }
            Err(e) => warn!("relay: cannot encode {}: {e}", envelope.kind()),
        }
    }

    fn broadcast(&self, code: &str, except: &str, envelope: &Envelope) {
        if let Some(members) = self.rooms.get(code) {
            for member in members.iter().filter(|m| m.as_str() != except) {
                self.deliver(code, member, envelope);
            }
        }
    }

    fn join(&mut self, id: u64, code: String, user: UserInfo) {
        if self.connections.get(&id).and_then(|c| c.joined.as_ref()).is_some() {
            self.leave(id);
        }

        // A rejoin under the same id supersedes the stale link silently.
        if let Some(stale) = self.connection_of(&user.id) {
            if stale != id {
                debug!(peer = %user.id, "relay: replacing stale link");
                if let Some(conn) = self.connections.get_mut(&stale) {
                    conn.joined = None;
                }
                self.connections.remove(&stale);
                if let Some(members) = self.rooms.get_mut(&code) {
                    members.retain(|m| m != &user.id);
                }
            }
        }

        let members = self.rooms.entry(code.clone()).or_default();
        let peers: Vec<String> = members.clone();
        members.push(user.id.clone());
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.joined = Some((code.clone(), user.id.clone()));
        }
        info!(room = %code, peer = %user.id, "relay: member joined ({} present)", peers.len());

        self.deliver(&code, &user.id, &Envelope::PeerRoster { peers });
        self.broadcast(
            &code,
            &user.id,
            &Envelope::PeerJoined {
                peer_id: user.id.clone(),
                user: Some(user.clone()),
            },
        );
    }

    /// Removes the member behind `id` from its room and announces it.
    fn leave(&mut self, id: u64) {
        let Some((code, peer_id)) = self.connections.get_mut(&id).and_then(|c| c.joined.take())
        else {
            return;
        };
        if let Some(members) = self.rooms.get_mut(&code) {
            members.retain(|m| m != &peer_id);
            if members.is_empty() {
                self.rooms.remove(&code);
            }
        }
        info!(room = %code, peer = %peer_id, "relay: member left");
        self.broadcast(&code, &peer_id, &Envelope::PeerLeft { peer_id: peer_id.clone() });
    }

    fn disconnect(&mut self, id: u64) {
        self.leave(id);
        if self.connections.remove(&id).is_some() {
            debug!(conn = id, "relay: link closed");
        }
    }

    fn route(&mut self, id: u64, envelope: Envelope) {
        let sender = self.connections.get(&id).and_then(|c| c.joined.clone());
        match envelope {
            Envelope::Join { code, user } => self.join(id, code, user),
            Envelope::Leave { .. } => self.leave(id),
            Envelope::Relay { to, signal, .. } => {
                let (Some((code, from)), Some(to)) = (sender, to) else {
                    debug!(conn = id, "relay: dropping unaddressed or unjoined relay");
                    return;
                };
                self.deliver(
                    &code,
                    &to,
                    &Envelope::Relay {
                        code: code.clone(),
                        to: Some(to.clone()),
                        from: Some(from),
                        signal,
                    },
                );
            }
            Envelope::Chat(body) => self.forward_aux(sender, body, Envelope::Chat),
            Envelope::HandRaise(body) => self.forward_aux(sender, body, Envelope::HandRaise),
            Envelope::Recording(body) => self.forward_aux(sender, body, Envelope::Recording),
            Envelope::ViewMode(body) => self.forward_aux(sender, body, Envelope::ViewMode),
            other => debug!(conn = id, "relay: ignoring client {}", other.kind()),
        }
    }

    fn forward_aux(
        &self,
        sender: Option<(String, String)>,
        body: AuxBody,
        wrap: fn(AuxBody) -> Envelope,
    ) {
        let Some((code, from)) = sender else {
            return;
        };
        let envelope = wrap(AuxBody {
            code: code.clone(),
            from: Some(from.clone()),
            payload: body.payload,
        });
        self.broadcast(&code, &from, &envelope);
    }
}

struct RelayLink {
    relay: LocalRelay,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
    open: bool,
}

impl RelayLink {
    fn shutdown(&mut self) {
        if self.open {
            self.open = false;
            self.relay.lock().disconnect(self.id);
        }
    }
}

#[async_trait]
impl SignalingLink for RelayLink {
    async fn send(&mut self, text: String) -> Result<(), SignalingError> {
        let envelope = Envelope::decode(&text)?;
        let mut state = self.relay.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(SignalingError::AbnormalClose("link dropped by relay".into()));
        }
        state.route(self.id, envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, SignalingError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.shutdown();
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

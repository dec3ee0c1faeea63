//! Reconnecting, ordered message channel to the relay.
//!
//! One task owns the link. It dials, sends `join` on every successful
//! connect, pumps envelopes both ways, and on link loss walks the
//! `backoff(n) -> connecting -> connected` machine until the policy gives up.

use super::envelope::Envelope;
use crate::config::ReconnectPolicy;
use crate::error::SignalingError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A connected duplex text channel.
#[async_trait]
pub trait SignalingLink: Send {
    async fn send(&mut self, text: String) -> Result<(), SignalingError>;

    /// Next inbound message; `None` once the remote end has closed.
    async fn recv(&mut self) -> Option<Result<String, SignalingError>>;

    async fn close(&mut self);
}

/// Opens links to the relay.
#[async_trait]
pub trait SignalingDialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn SignalingLink>, SignalingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Backoff { attempt: u32, delay: Duration },
    Exhausted,
    Closed,
}

impl LinkState {
    /// State after the link failed `failures` times in a row.
    pub fn after_failure(failures: u32, policy: &ReconnectPolicy) -> LinkState {
        match policy.next_delay(failures) {
            Some(delay) => LinkState::Backoff {
                attempt: failures,
                delay,
            },
            None => LinkState::Exhausted,
        }
    }

    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// `join` was sent on a fresh link. `reconnect` is false the first time.
    Connected { reconnect: bool },
    Envelope(Envelope),
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted; the task has stopped.
    Lost(SignalingError),
}

enum Command {
    Send(Envelope),
    Close,
}

enum PumpEnd {
    Closed,
    Lost(SignalingError),
}

/// Handle on the transport task.
pub struct SignalingHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    task: Option<JoinHandle<()>>,
}

/// Starts the transport task. `join` is re-sent on every connect.
pub fn spawn(
    dialer: Arc<dyn SignalingDialer>,
    join: Envelope,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> SignalingHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(LinkState::Idle);
    let task = tokio::spawn(run(dialer, join, policy, rx, events, state_tx));
    SignalingHandle {
        commands,
        state,
        task: Some(task),
    }
}

impl SignalingHandle {
    /// Queues an envelope. While the link is down it is dropped.
    pub fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.commands
            .send(Command::Send(envelope))
            .map_err(|_| SignalingError::Closed)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Closes the link and waits for the task to finish. Queued envelopes
    /// are flushed first.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("signaling task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    dialer: Arc<dyn SignalingDialer>,
    join: Envelope,
    policy: ReconnectPolicy,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<LinkState>,
) {
    let mut failures: u32 = 0;
    let mut connected_before = false;

    loop {
        state.send_replace(LinkState::Connecting {
            attempt: failures + 1,
        });

        let error = match connect(dialer.as_ref(), &join).await {
            Ok(mut link) => {
                info!(reconnect = connected_before, "signaling connected");
                state.send_replace(LinkState::Connected);
                let _ = events.send(TransportEvent::Connected {
                    reconnect: connected_before,
                });
                connected_before = true;

                match pump(link.as_mut(), &mut commands, &events, &mut failures).await {
                    PumpEnd::Closed => {
                        link.close().await;
                        state.send_replace(LinkState::Closed);
                        info!("signaling closed");
                        return;
                    }
                    PumpEnd::Lost(e) => {
                        link.close().await;
                        e
                    }
                }
            }
            Err(e) => e,
        };

        failures += 1;
        match LinkState::after_failure(failures, &policy) {
            LinkState::Backoff { attempt, delay } => {
                warn!("signaling link lost ({error}), retry {attempt} in {delay:?}");
                state.send_replace(LinkState::Backoff { attempt, delay });
                let _ = events.send(TransportEvent::Reconnecting { attempt, delay });
                if !wait_backoff(delay, &mut commands).await {
                    state.send_replace(LinkState::Closed);
                    return;
                }
            }
            _ => {
                warn!("signaling link lost ({error}), giving up");
                state.send_replace(LinkState::Exhausted);
                let _ = events.send(TransportEvent::Lost(SignalingError::Exhausted {
                    attempts: policy.max_attempts,
                }));
                return;
            }
        }
    }
}

async fn connect(
    dialer: &dyn SignalingDialer,
    join: &Envelope,
) -> Result<Box<dyn SignalingLink>, SignalingError> {
    let mut link = dialer.dial().await?;
    if let Err(e) = link.send(join.encode()?).await {
        link.close().await;
        return Err(e);
    }
    Ok(link)
}

/// Pumps until the link ends. `failures` is cleared by the first inbound
/// envelope: a link that drops before any traffic still counts against the
/// reconnect budget.
async fn pump(
    link: &mut dyn SignalingLink,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    failures: &mut u32,
) -> PumpEnd {
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(envelope)) => {
                    let text = match envelope.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("cannot encode {} envelope: {e}", envelope.kind());
                            continue;
                        }
                    };
                    if let Err(e) = link.send(text).await {
                        return PumpEnd::Lost(e);
                    }
                }
                Some(Command::Close) | None => return PumpEnd::Closed,
            },
            msg = link.recv() => match msg {
                Some(Ok(text)) => match Envelope::decode(&text) {
                    Ok(envelope) => {
                        debug!("<- {}", envelope.kind());
                        *failures = 0;
                        let _ = events.send(TransportEvent::Envelope(envelope));
                    }
                    Err(e) => warn!("dropping inbound message: {e}"),
                },
                Some(Err(SignalingError::Malformed(e))) => {
                    warn!("dropping inbound frame: {e}");
                }
                Some(Err(e)) => return PumpEnd::Lost(e),
                None => {
                    return PumpEnd::Lost(SignalingError::AbnormalClose(
                        "relay closed the link".into(),
                    ))
                }
            },
        }
    }
}

/// Sleeps through a backoff delay, dropping envelopes submitted meanwhile.
/// Returns false if the transport was closed during the wait.
async fn wait_backoff(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                Some(Command::Send(envelope)) => {
                    debug!("link down, dropping {} envelope", envelope.kind());
                }
                Some(Command::Close) | None => return false,
            },
        }
    }
}

//! Relay client: one persistent WebSocket per session, with reconnects.
//!
//! Outgoing messages are queued through a [`RelayHandle`]; incoming
//! messages come out of a single [`Inbound`] receiver. There is exactly one
//! receiver per client, so nothing can register a second handler behind the
//! call controller's back.

use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::time;

use super::websocket::ClientSocket;
use super::{RelayFrame, SignalMessage, SignalSender, UserId};

/// Keepalive ping interval on an idle relay socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A session that lasted at least this long resets the backoff.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Upper bound for the reconnect delay.
const MAX_BACKOFF_SECS: u64 = 64;

/// A signaling message delivered by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: UserId,
    pub message: SignalMessage,
}

/// Cheap clonable sender side of the relay client.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    outbound: mpsc::UnboundedSender<(UserId, SignalMessage)>,
    connected: watch::Receiver<bool>,
}

impl RelayHandle {
    /// True while registered with the relay.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the client is registered. Fails if the client stopped.
    pub async fn wait_connected(&self) -> anyhow::Result<()> {
        let mut rx = self.connected.clone();
        rx.wait_for(|up| *up)
            .await
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("Relay client stopped"))
    }
}

impl SignalSender for RelayHandle {
    fn send(&self, to: &UserId, message: SignalMessage) {
        let kind = message.kind();
        if self.outbound.send((to.clone(), message)).is_err() {
            tracing::warn!("Relay client stopped; dropping {} for {}", kind, to);
        }
    }
}

/// Reason one connected session ended.
enum DisconnectReason {
    /// Every handle or the inbound receiver is gone. Do not reconnect.
    Shutdown,
    /// Error or relay-initiated close. Should reconnect.
    Error(anyhow::Error),
}

pub struct RelayClient {
    relay_url: String,
    user_id: UserId,
    outbound: mpsc::UnboundedReceiver<(UserId, SignalMessage)>,
    inbound: mpsc::UnboundedSender<Inbound>,
    connected: watch::Sender<bool>,
}

impl RelayClient {
    /// Build a client for `user_id`. Nothing connects until [`RelayClient::run`].
    pub fn new(
        relay_url: impl Into<String>,
        user_id: UserId,
    ) -> (Self, RelayHandle, mpsc::UnboundedReceiver<Inbound>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (up_tx, up_rx) = watch::channel(false);
        let client = Self {
            relay_url: relay_url.into(),
            user_id,
            outbound: out_rx,
            inbound: in_tx,
            connected: up_tx,
        };
        let handle = RelayHandle {
            outbound: out_tx,
            connected: up_rx,
        };
        (client, handle, in_rx)
    }

    /// Keep a relay session up until the client is no longer needed.
    ///
    /// Reconnects with exponential backoff (see [`Backoff`]). Messages queued
    /// while disconnected are dropped: signaling is fire-and-forget and a
    /// stale offer or candidate is worse than none.
    pub async fn run(mut self) {
        let mut backoff = Backoff::default();

        loop {
            let started = Instant::now();
            let reason = self.run_session().await;
            self.connected.send_replace(false);
            match reason {
                DisconnectReason::Shutdown => {
                    tracing::info!("Relay client for {} shutting down", self.user_id);
                    return;
                }
                DisconnectReason::Error(e) => {
                    let delay = backoff.next_delay(started.elapsed());
                    tracing::warn!(
                        "Relay disconnected: {:#}. Reconnecting in {}s...",
                        e,
                        delay.as_secs()
                    );
                    if !self.drain_while_down(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Run one connected session: connect, register, pump frames.
    async fn run_session(&mut self) -> DisconnectReason {
        let connect = ClientSocket::connect(&self.relay_url);
        tokio::pin!(connect);
        // Not registered yet, so anything queued now counts as sent while down.
        let mut ws = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(ws) => break ws,
                    Err(e) => return DisconnectReason::Error(e),
                },
                out = self.outbound.recv() => match out {
                    Some((to, message)) => drop_while_down(&to, &message),
                    None => return DisconnectReason::Shutdown,
                },
            }
        };

        let register = RelayFrame::Register {
            user_id: self.user_id.clone(),
        };
        if let Err(e) = ws.send_frame(&register).await {
            return DisconnectReason::Error(e.context("Relay registration failed"));
        }
        tracing::info!("Registered with relay as {}", self.user_id);
        self.connected.send_replace(true);

        let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // skip first immediate tick

        let reason = loop {
            tokio::select! {
                out = self.outbound.recv() => {
                    let Some((to, message)) = out else {
                        break DisconnectReason::Shutdown;
                    };
                    tracing::debug!("Sending {} for call {} to {}", message.kind(), message.call_id(), to);
                    if let Err(e) = ws.send_frame(&RelayFrame::Send { to, message }).await {
                        break DisconnectReason::Error(e);
                    }
                }
                frame = ws.recv_frame() => {
                    match frame {
                        Ok(Some(RelayFrame::Deliver { from, message })) => {
                            if self.inbound.send(Inbound { from, message }).is_err() {
                                break DisconnectReason::Shutdown;
                            }
                        }
                        Ok(Some(other)) => {
                            tracing::debug!("Ignoring unexpected relay frame: {:?}", other);
                        }
                        Ok(None) => {
                            break DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by relay"));
                        }
                        Err(e) => {
                            break DisconnectReason::Error(e.context("WebSocket recv error"));
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = ws.ping().await.context("Heartbeat send failed") {
                        break DisconnectReason::Error(e);
                    }
                }
            }
        };

        if matches!(reason, DisconnectReason::Shutdown) {
            ws.close().await;
        }
        reason
    }

    /// Wait out the backoff, discarding anything queued meanwhile.
    ///
    /// Returns `false` when every handle was dropped during the wait.
    async fn drain_while_down(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return !self.inbound.is_closed(),
                out = self.outbound.recv() => match out {
                    Some((to, message)) => drop_while_down(&to, &message),
                    None => return false,
                },
            }
        }
    }
}

fn drop_while_down(to: &UserId, message: &SignalMessage) {
    tracing::warn!(
        "Relay down; dropping {} for call {} to {}",
        message.kind(),
        message.call_id(),
        to
    );
}

/// Reconnect delay schedule: 1s doubling up to 64s, back to 1s after a
/// session that stayed up for [`STABILITY_THRESHOLD`].
#[derive(Debug)]
struct Backoff {
    next_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { next_secs: 1 }
    }
}

impl Backoff {
    /// Delay before the next attempt, given how long the last session lasted.
    fn next_delay(&mut self, session: Duration) -> Duration {
        if session >= STABILITY_THRESHOLD {
            self.next_secs = 1;
        }
        let secs = self.next_secs;
        self.next_secs = (secs * 2).min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}

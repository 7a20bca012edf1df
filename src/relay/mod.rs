//! Signaling relay server.
//!
//! Forwards signaling messages between users who currently hold an open
//! WebSocket. No persistence and no store-and-forward: a message for a user
//! who is not connected is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::signaling::websocket::RelaySocket;
use crate::signaling::{RelayFrame, SignalMessage, UserId};

/// One live socket bound to a user.
struct Registration {
    conn_id: u64,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

/// Registry of online users and their outbound queues.
#[derive(Default)]
pub struct Relay {
    online: RwLock<HashMap<UserId, Registration>>,
    next_conn_id: AtomicU64,
}

/// Bind `listen` and serve until the process exits.
pub async fn serve(listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind relay on {}", listen))?;
    tracing::info!("Relay listening on {}", listener.local_addr()?);
    Arc::new(Relay::default()).run(listener).await
}

/// Bind `listen` and serve on a background task.
///
/// Returns the bound address (useful with port 0) and the relay so callers
/// can inspect who is online.
pub async fn spawn(listen: &str) -> Result<(SocketAddr, Arc<Relay>, JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind relay on {}", listen))?;
    let addr = listener.local_addr()?;
    let relay = Arc::new(Relay::default());
    let handle = tokio::spawn(relay.clone().run(listener));
    Ok((addr, relay, handle))
}

impl Relay {
    /// Accept connections forever, one task per socket.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (tcp, addr) = listener.accept().await.context("Relay accept failed")?;
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(tcp, addr).await {
                    tracing::warn!("Relay connection {} ended: {:#}", addr, e);
                }
            });
        }
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.online.read().await.contains_key(user)
    }

    pub async fn online_count(&self) -> usize {
        self.online.read().await.len()
    }

    async fn handle_connection(&self, tcp: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut ws = RelaySocket::accept(tcp).await?;

        let user = match ws.recv_frame().await? {
            Some(RelayFrame::Register { user_id }) => user_id,
            Some(other) => {
                ws.close().await;
                anyhow::bail!("expected register frame from {}, got {:?}", addr, other);
            }
            None => return Ok(()),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = self.register(&user, tx).await;
        tracing::info!("{} registered from {}", user, addr);

        let result = loop {
            tokio::select! {
                frame = ws.recv_frame() => match frame {
                    Ok(Some(RelayFrame::Send { to, message })) => {
                        self.forward(&user, &to, message).await;
                    }
                    Ok(Some(other)) => {
                        tracing::warn!("Ignoring {:?} from {}", other, user);
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                out = rx.recv() => match out {
                    Some(frame) => {
                        if let Err(e) = ws.send_frame(&frame).await {
                            break Err(e);
                        }
                    }
                    // Replaced by a newer registration for the same user.
                    None => {
                        tracing::info!("{} re-registered elsewhere; closing {}", user, addr);
                        ws.close().await;
                        break Ok(());
                    }
                },
            }
        };

        self.unregister(&user, conn_id).await;
        tracing::info!("{} disconnected ({})", user, addr);
        result
    }

    async fn register(&self, user: &UserId, tx: mpsc::UnboundedSender<RelayFrame>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .online
            .write()
            .await
            .insert(user.clone(), Registration { conn_id, tx });
        if previous.is_some() {
            tracing::debug!("Replacing previous socket for {}", user);
        }
        conn_id
    }

    /// Remove the entry only if it still belongs to `conn_id`.
    async fn unregister(&self, user: &UserId, conn_id: u64) {
        let mut online = self.online.write().await;
        if online.get(user).is_some_and(|r| r.conn_id == conn_id) {
            online.remove(user);
        }
    }

    async fn forward(&self, from: &UserId, to: &UserId, message: SignalMessage) {
        let online = self.online.read().await;
        let Some(target) = online.get(to) else {
            tracing::debug!(
                "{} offline; dropping {} for call {} from {}",
                to,
                message.kind(),
                message.call_id(),
                from
            );
            return;
        };
        tracing::debug!("Forwarding {} {} -> {}", message.kind(), from, to);
        let frame = RelayFrame::Deliver {
            from: from.clone(),
            message,
        };
        if target.tx.send(frame).is_err() {
            tracing::debug!("{} disconnected mid-forward", to);
        }
    }
}

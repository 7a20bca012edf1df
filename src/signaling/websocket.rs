//! Relay WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use super::RelayFrame;

/// A WebSocket carrying JSON-encoded [`RelayFrame`]s.
///
/// The same framing is used on both ends: clients connect with
/// [`RelaySocket::connect`], the relay wraps accepted TCP streams with
/// [`RelaySocket::accept`].
pub struct RelaySocket<S> {
    stream: WebSocketStream<S>,
}

pub type ClientSocket = RelaySocket<MaybeTlsStream<TcpStream>>;

impl ClientSocket {
    /// Connect to the relay endpoint.
    ///
    /// `http(s)://` URLs are accepted and rewritten to `ws(s)://`.
    pub async fn connect(relay_url: &str) -> Result<Self> {
        let ws_url = normalize_ws_url(relay_url)?;

        tracing::info!("Connecting WebSocket to {}", ws_url);

        let (stream, response) = connect_async(ws_url.as_str())
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }
}

impl RelaySocket<TcpStream> {
    /// Complete the WebSocket handshake on an accepted TCP connection.
    pub async fn accept(tcp: TcpStream) -> Result<Self> {
        let stream = accept_async(tcp)
            .await
            .context("WebSocket handshake failed")?;
        Ok(Self { stream })
    }
}

impl<S> RelaySocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one frame as a JSON text message.
    pub async fn send_frame(&mut self, frame: &RelayFrame) -> Result<()> {
        let text = serde_json::to_string(frame).context("Failed to encode relay frame")?;
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Send a WebSocket ping (keeps idle NAT mappings and proxies alive).
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send ping")
    }

    /// Receive the next relay frame, answering pings and skipping frames
    /// that do not decode.
    ///
    /// Returns `Ok(None)` once the peer closed the socket.
    pub async fn recv_frame(&mut self) -> Result<Option<RelayFrame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(e) => {
                            tracing::warn!("Dropping malformed relay frame: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    /// Close the socket, ignoring errors (the peer may already be gone).
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}

/// Rewrite an http(s) relay URL to its ws(s) form and validate it.
pub fn normalize_ws_url(relay_url: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(relay_url)
        .with_context(|| format!("Invalid relay URL: {}", relay_url))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => anyhow::bail!("Unsupported relay URL scheme: {}", other),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Cannot rewrite scheme of {}", relay_url))?;
    }
    Ok(url)
}

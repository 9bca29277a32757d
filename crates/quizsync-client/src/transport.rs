//! Transport abstraction and the WebSocket implementation.
//!
//! The connection manager only sees [`Connector`] (opens a link) and
//! [`Transport`] (moves text frames over it). [`WsConnector`] is the
//! production pair on top of `tokio-tungstenite`; tests use
//! [`crate::testing::MemoryConnector`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use quizsync_core::errors::{ClientError, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// A bidirectional text-frame link to the session authority.
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next text frame.
    ///
    /// `None` means the peer closed the link cleanly.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the link.
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports. One call per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `url`, presenting `credential` when present.
    async fn open(&self, url: &str, credential: Option<&str>) -> Result<Box<dyn Transport>>;
}

// ── WebSocket ───────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] over `tokio-tungstenite`.
///
/// The credential travels as an `Authorization: Bearer` header on the
/// upgrade request; an HTTP rejection of the upgrade is a connect failure.
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector with the given per-attempt budget.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str, credential: Option<&str>) -> Result<Box<dyn Transport>> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Connection(format!("invalid url {url:?}: {e}")))?;
        if let Some(token) = credential {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::InvalidArgument("credential is not a valid header value".into()))?;
            let _ = request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(url, "opening websocket");
        let (stream, response) =
            match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => return Err(map_handshake_error(e)),
                Err(_) => {
                    return Err(ClientError::Connection(format!(
                        "connect timed out after {:?}",
                        self.connect_timeout
                    )));
                }
            };
        info!(url, status = %response.status(), "websocket open");
        Ok(Box::new(WsTransport { stream }))
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ClientError {
    match err {
        tungstenite::Error::Http(response) => {
            ClientError::Connection(format!("handshake rejected: {}", response.status()))
        }
        other => ClientError::Connection(other.to_string()),
    }
}

/// [`Transport`] over an established WebSocket stream.
pub struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(s) => return Some(Ok(s.to_owned())),
                    Err(_) => {
                        return Some(Err(ClientError::Protocol(format!(
                            "non-UTF8 binary frame ({} bytes)",
                            data.len()
                        ))));
                    }
                },
                Message::Close(frame) => {
                    debug!(?frame, "peer sent close frame");
                    return None;
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ClientError::Transport(e.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! In-memory transport for deterministic tests.
//!
//! [`MemoryConnector`] hands out channel-backed transports. Each accepted
//! connect yields a [`MemoryPeer`] that plays the session authority: it
//! reads the frames the client sent and pushes events back.
//!
//! ```ignore
//! let connector = MemoryConnector::new();
//! let client = GameSessionClient::with_connector(settings, connector.clone());
//! client.connect(Some("token".into())).await?;
//! let mut peer = connector.next_peer().await.unwrap();
//! let frame = peer.recv_frame().await;
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quizsync_core::errors::{ClientError, Result};
use quizsync_core::protocol::{OutboundFrame, SessionEvent};
use tokio::sync::mpsc;

use crate::transport::{Connector, Transport};

struct Shared {
    refusals: Mutex<VecDeque<ClientError>>,
    refuse_all: Mutex<Option<ClientError>>,
    credentials: Mutex<Vec<Option<String>>>,
    attempts: AtomicU32,
    open_delay: Mutex<Duration>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

/// [`Connector`] backed by in-process channels.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// A connector that accepts every attempt.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                refusals: Mutex::new(VecDeque::new()),
                refuse_all: Mutex::new(None),
                credentials: Mutex::new(Vec::new()),
                attempts: AtomicU32::new(0),
                open_delay: Mutex::new(Duration::ZERO),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Fail the next attempt with `err`. Queued refusals are consumed in order.
    pub fn refuse_next(&self, err: ClientError) {
        self.shared.refusals.lock().push_back(err);
    }

    /// Fail every attempt with `err` until [`accept_all`](Self::accept_all).
    pub fn refuse_all(&self, err: ClientError) {
        *self.shared.refuse_all.lock() = Some(err);
    }

    /// Stop refusing attempts.
    pub fn accept_all(&self) {
        *self.shared.refuse_all.lock() = None;
        self.shared.refusals.lock().clear();
    }

    /// Hold every subsequent `open` for `delay` before it settles.
    pub fn delay_open(&self, delay: Duration) {
        *self.shared.open_delay.lock() = delay;
    }

    /// Number of `open` calls so far.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Credentials presented on each attempt, in order.
    pub fn credentials(&self) -> Vec<Option<String>> {
        self.shared.credentials.lock().clone()
    }

    /// Wait for the authority side of the next accepted connection.
    ///
    /// Never `None` in practice: the connector holds a sender itself.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.shared.peers_rx.lock().await.recv().await
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _url: &str, credential: Option<&str>) -> Result<Box<dyn Transport>> {
        let _ = self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared
            .credentials
            .lock()
            .push(credential.map(str::to_owned));

        let delay = *self.shared.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.shared.refusals.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.shared.refuse_all.lock().clone() {
            return Err(err);
        }

        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            inbound: to_peer_rx,
            outbound: Some(to_client_tx),
        };
        let _ = self.shared.peers_tx.send(peer);
        Ok(Box::new(MemoryTransport {
            outbound: to_peer_tx,
            inbound: to_client_rx,
        }))
    }
}

/// Client half of an in-memory link.
struct MemoryTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| ClientError::Transport("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.inbound.close();
        Ok(())
    }
}

/// Authority half of an in-memory link.
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl MemoryPeer {
    /// Next raw text frame from the client; `None` once the client hung up.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next decodable frame from the client. Undecodable frames are skipped.
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        loop {
            let text = self.recv_text().await?;
            if let Ok(frame) = serde_json::from_str(&text) {
                return Some(frame);
            }
        }
    }

    /// Next frame that is not a heartbeat ping.
    pub async fn recv_command(&mut self) -> Option<OutboundFrame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.command.name() != quizsync_core::protocol::commands::PING {
                return Some(frame);
            }
        }
    }

    /// Frames already queued, without waiting.
    pub fn drain_frames(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.inbound.try_recv() {
            if let Ok(frame) = serde_json::from_str(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Push an event to the client.
    pub fn push(&self, event: &SessionEvent) {
        if let (Some(tx), Ok(text)) = (&self.outbound, event.encode()) {
            let _ = tx.send(text);
        }
    }

    /// Push a raw text frame to the client.
    pub fn push_raw(&self, text: &str) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(text.to_owned());
        }
    }

    /// Close the authority side; the client sees a clean close.
    pub fn close(&mut self) {
        self.outbound = None;
    }

    /// Whether the client side has gone away.
    pub fn is_client_closed(&self) -> bool {
        self.outbound.as_ref().is_none_or(mpsc::UnboundedSender::is_closed)
    }
}

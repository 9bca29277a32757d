//! Connection lifecycle: connect, heartbeat, reconnect with backoff, teardown.
//!
//! [`ConnectionManager`] owns the single link to the session authority.
//!
//! ```text
//! disconnected ──connect──▶ connecting ──ok──▶ connected
//!       ▲                       │                  │
//!       │                     fail            lost / dead
//!   disconnect                  ▼                  ▼
//!       │                     error ◀──────────── error
//!       │                       │
//!       └──────────────── reconnecting ──delay──▶ connecting
//! ```
//!
//! Each established link runs in its own task that multiplexes outbound
//! frames, inbound frames and heartbeat ticks with `tokio::select!`.
//! Inbound events go to registered [`InboundObserver`]s (the request
//! correlator) first, then to the [`EventDispatcher`].
//!
//! Automatic reconnection runs in at most one task at a time. Attempt `k`
//! waits [`ReconnectSettings::delay_for`]`(k)`; once the budget is spent a
//! single `maxReconnectAttemptsReached` event is emitted and nothing more
//! happens until the caller connects again.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quizsync_core::errors::{ClientError, Result};
use quizsync_core::ids::{ConnectionId, RequestId};
use quizsync_core::model::ConnectionState;
use quizsync_core::protocol::{Command, OutboundFrame, SessionEvent, events, lifecycle};
use quizsync_settings::{ClientSettings, HeartbeatSettings, ReconnectSettings};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::dispatcher::EventDispatcher;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::transport::{Connector, Transport};

/// Sees every inbound authority event before the dispatcher does.
///
/// Observers survive [`ConnectionManager::disconnect`], which clears
/// dispatcher subscriptions.
pub trait InboundObserver: Send + Sync {
    /// Inspect one inbound event. Must not block.
    fn observe(&self, event: &SessionEvent);
}

struct ActiveConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

struct Inner {
    url: String,
    require_credential: bool,
    reconnect: ReconnectSettings,
    heartbeat: HeartbeatSettings,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<EventDispatcher>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Set once the reconnect budget is spent; cleared by the next connect
    /// or disconnect.
    exhausted: AtomicBool,
    /// Bumped by every teardown the caller asks for; in-flight connects and
    /// reconnect loops from an older epoch abandon their work.
    epoch: AtomicU64,
    credential: Mutex<Option<String>>,
    active: Mutex<Option<ActiveConnection>>,
    reconnect_task: Mutex<Option<CancellationToken>>,
    observers: Mutex<Vec<Weak<dyn InboundObserver>>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

/// Owner of the single persistent connection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager in the `disconnected` state. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(
        settings: &ClientSettings,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: settings.connection.url.clone(),
                require_credential: settings.connection.require_credential,
                reconnect: settings.reconnect.clone(),
                heartbeat: settings.heartbeat.clone(),
                connector,
                dispatcher,
                state,
                attempts: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                credential: Mutex::new(None),
                active: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                last_heartbeat: Mutex::new(None),
            }),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether the state is `connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Automatic attempts made since the last successful or manual connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Whether automatic reconnection gave up and is waiting for a manual
    /// connect.
    pub fn is_exhausted(&self) -> bool {
        self.inner.exhausted.load(Ordering::SeqCst)
    }

    /// `Ok` while connected. Otherwise [`ClientError::ReconnectExhausted`]
    /// once the reconnect budget is spent, [`ClientError::NotConnected`]
    /// before that.
    pub fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else if self.is_exhausted() {
            Err(ClientError::ReconnectExhausted {
                attempts: self.reconnect_attempts(),
            })
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Identity of the current connection, if one is established.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.active.lock().as_ref().map(|c| c.id.clone())
    }

    /// When the last heartbeat pong arrived.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_heartbeat.lock()
    }

    /// The dispatcher lifecycle and authority events are delivered to.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    /// Register an observer. Held weakly; dropped observers are pruned.
    pub fn add_observer(&self, observer: Weak<dyn InboundObserver>) {
        self.inner.observers.lock().push(observer);
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the connection.
    ///
    /// A no-op while `connecting` or `connected`. A `Some` credential
    /// replaces the stored one; `None` reuses it. Calling `connect` cancels
    /// any scheduled retry and restores the full reconnect budget. On
    /// failure a reconnect is scheduled unless retrying cannot help
    /// (missing or malformed credential).
    #[instrument(skip_all)]
    pub async fn connect(&self, credential: Option<String>) -> Result<()> {
        if let Some(c) = credential {
            *self.inner.credential.lock() = Some(c);
        }

        let claimed = self.inner.state.send_if_modified(|s| match s {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                *s = ConnectionState::Connecting;
                true
            }
        });
        if !claimed {
            debug!(state = %self.state(), "connect ignored");
            return Ok(());
        }

        self.cancel_reconnect();
        self.inner.exhausted.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        match self.open(epoch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.should_retry(&err, epoch) {
                    self.spawn_reconnect();
                }
                Err(err)
            }
        }
    }

    /// Close the connection and reset.
    ///
    /// Idempotent. Emits `disconnected{reason: "client disconnect"}`, then
    /// clears every dispatcher subscription, cancels the heartbeat and any
    /// scheduled reconnect. In-flight correlated operations are left to
    /// time out.
    pub fn disconnect(&self) {
        self.cancel_reconnect();
        let old = self.take_active();
        let was = self.state();
        if let Some(conn) = &old {
            conn.cancel.cancel();
        }
        if old.is_none() && was == ConnectionState::Disconnected {
            return;
        }

        info!(state = %was, "disconnecting");
        self.emit(lifecycle::DISCONNECTED, json!({"reason": "client disconnect"}));
        self.inner.dispatcher.clear();
        self.inner.exhausted.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Tear down any connection and connect again with the last credential
    /// and a fresh reconnect budget. Subscriptions are kept.
    pub async fn reconnect_manually(&self) -> Result<()> {
        info!("manual reconnect");
        self.cancel_reconnect();
        if let Some(conn) = self.take_active() {
            conn.cancel.cancel();
            self.emit(
                lifecycle::DISCONNECTED,
                json!({"reason": "manual reconnect", "connectionId": conn.id}),
            );
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        self.connect(None).await
    }

    /// Resolve once the state is `connected`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout {
                operation: "wait_for_connection".into(),
                after: timeout,
            }),
        }
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Queue a text frame on the current connection. Never blocks.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.ensure_connected()?;
        match self.inner.active.lock().as_ref() {
            Some(conn) => conn
                .outbound
                .send(text)
                .map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Encode and queue a frame.
    pub fn send_frame(&self, frame: &OutboundFrame) -> Result<()> {
        self.send_text(frame.encode()?)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn set_state(&self, next: ConnectionState) {
        let prev = self.inner.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "state");
        }
    }

    fn emit(&self, name: &str, data: Value) {
        let _ = self
            .inner
            .dispatcher
            .emit(&SessionEvent::lifecycle(name, data));
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) == epoch
    }

    fn should_retry(&self, err: &ClientError, epoch: u64) -> bool {
        !matches!(
            err,
            ClientError::MissingCredential | ClientError::InvalidArgument(_)
        ) && self.is_current(epoch)
    }

    /// Remove the active connection and start a new epoch.
    fn take_active(&self) -> Option<ActiveConnection> {
        let mut active = self.inner.active.lock();
        let _ = self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        active.take()
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = self.inner.reconnect_task.lock().take() {
            token.cancel();
        }
    }

    fn fail_attempt(&self, err: &ClientError, will_retry: bool) {
        warn!(error = %err, will_retry, "connect failed");
        self.set_state(ConnectionState::Error);
        self.emit(
            lifecycle::CONNECTION_ERROR,
            json!({
                "message": err.to_string(),
                "kind": err.kind(),
                "attempt": self.reconnect_attempts(),
                "willRetry": will_retry,
            }),
        );
    }

    /// One connect attempt. The caller has already moved the state to
    /// `connecting`.
    async fn open(&self, epoch: u64) -> Result<()> {
        let credential = self.inner.credential.lock().clone();
        if self.inner.require_credential && credential.is_none() {
            let err = ClientError::MissingCredential;
            self.fail_attempt(&err, false);
            return Err(err);
        }

        info!(url = %self.inner.url, attempt = self.reconnect_attempts(), "connecting");
        let mut transport = match self
            .inner
            .connector
            .open(&self.inner.url, credential.as_deref())
            .await
        {
            Ok(t) => t,
            Err(err) => {
                if self.is_current(epoch) {
                    let retry = self.should_retry(&err, epoch)
                        && self.reconnect_attempts() < self.inner.reconnect.max_attempts;
                    self.fail_attempt(&err, retry);
                }
                return Err(err);
            }
        };

        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let installed = {
            let mut active = self.inner.active.lock();
            if self.is_current(epoch) {
                if let Some(old) = active.take() {
                    old.cancel.cancel();
                }
                *active = Some(ActiveConnection {
                    id: id.clone(),
                    outbound: tx,
                    cancel: cancel.clone(),
                });
                true
            } else {
                false
            }
        };
        if !installed {
            debug!("connect superseded by teardown");
            let _ = transport.close().await;
            return Err(ClientError::Connection("connect cancelled".into()));
        }

        // the slot must be free before the link task can report a loss
        self.cancel_reconnect();
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!(connection_id = %id, "connected");
        self.emit(lifecycle::CONNECTED, json!({"connectionId": id}));

        let this = self.clone();
        let _ = tokio::spawn(async move { this.run_connection(id, transport, rx, cancel).await });
        Ok(())
    }

    fn spawn_reconnect(&self) {
        let token = {
            let mut slot = self.inner.reconnect_task.lock();
            if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        let this = self.clone();
        let _ = tokio::spawn(async move { this.reconnect_loop(token).await });
    }

    async fn reconnect_loop(&self, cancel: CancellationToken) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let max = self.inner.reconnect.max_attempts;
        loop {
            let done = self.reconnect_attempts();
            if done >= max {
                self.inner.exhausted.store(true, Ordering::SeqCst);
                self.set_state(ConnectionState::Error);
                warn!(attempts = done, "max reconnect attempts reached");
                self.emit(
                    lifecycle::MAX_RECONNECT_ATTEMPTS_REACHED,
                    json!({"attempts": done}),
                );
                break;
            }

            let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.inner.reconnect.delay_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.set_state(ConnectionState::Reconnecting);
            info!(attempt, max, delay_ms, "reconnect scheduled");
            self.emit(
                lifecycle::RECONNECTING,
                json!({"attempt": attempt, "delayMs": delay_ms}),
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let claimed = self.inner.state.send_if_modified(|s| {
                if *s == ConnectionState::Reconnecting {
                    *s = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if !claimed || cancel.is_cancelled() || !self.is_current(epoch) {
                break;
            }

            match self.open(epoch).await {
                Ok(()) => break,
                Err(err) if !self.should_retry(&err, epoch) => break,
                Err(_) => {}
            }
        }
        // frees the slot for the next loss
        cancel.cancel();
    }

    fn connection_lost(&self, id: &ConnectionId, reason: &str) {
        let was_active = {
            let mut active = self.inner.active.lock();
            if active.as_ref().is_some_and(|c| c.id == *id) {
                *active = None;
                true
            } else {
                false
            }
        };
        if !was_active {
            return;
        }

        warn!(connection_id = %id, reason, "connection lost");
        self.set_state(ConnectionState::Error);
        self.emit(
            lifecycle::DISCONNECTED,
            json!({"reason": reason, "connectionId": id}),
        );
        self.spawn_reconnect();
    }

    fn notify_observers(&self, event: &SessionEvent) {
        let live: Vec<Arc<dyn InboundObserver>> = {
            let mut observers = self.inner.observers.lock();
            observers.retain(|w| w.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.observe(event);
        }
    }

    fn handle_frame(&self, text: &str, monitor: &mut HeartbeatMonitor) {
        let event = match SessionEvent::decode(text) {
            Ok(ev) => ev,
            Err(err) => {
                warn!(error = %err, "malformed frame");
                self.emit(lifecycle::SOCKET_ERROR, json!({"message": err.to_string()}));
                return;
            }
        };
        trace!(event = %event.event_type, reply_to = ?event.reply_to, "received");

        if event.is(events::PONG) {
            monitor.mark_alive();
            *self.inner.last_heartbeat.lock() = Some(Utc::now());
        }
        self.notify_observers(&event);
        let _ = self.inner.dispatcher.emit(&event);
    }

    #[instrument(skip_all, fields(connection_id = %id))]
    async fn run_connection(
        self,
        id: ConnectionId,
        mut transport: Box<dyn Transport>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let period = self.inner.heartbeat.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitor = HeartbeatMonitor::new(self.inner.heartbeat.max_missed);

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("connection closed by client");
                    let _ = transport.close().await;
                    return;
                }
                msg = outbound.recv() => {
                    let Some(text) = msg else {
                        let _ = transport.close().await;
                        return;
                    };
                    trace!(frame = %text, "send");
                    if let Err(err) = transport.send(text).await {
                        break format!("send failed: {err}");
                    }
                }
                incoming = transport.recv() => match incoming {
                    Some(Ok(text)) => self.handle_frame(&text, &mut monitor),
                    Some(Err(err @ ClientError::Protocol(_))) => {
                        warn!(error = %err, "unreadable frame");
                        self.emit(lifecycle::SOCKET_ERROR, json!({"message": err.to_string()}));
                    }
                    Some(Err(err)) => break err.to_string(),
                    None => break "transport closed".to_owned(),
                },
                _ = ticker.tick() => {
                    match monitor.on_tick() {
                        HeartbeatVerdict::Ping => {}
                        HeartbeatVerdict::Missed { missed } => {
                            warn!(missed, "heartbeat missed");
                            self.emit(lifecycle::HEARTBEAT_MISSED, json!({"missed": missed}));
                        }
                        HeartbeatVerdict::Dead { missed } => {
                            warn!(missed, "heartbeat dead");
                            self.emit(lifecycle::HEARTBEAT_MISSED, json!({"missed": missed}));
                            break format!("heartbeat timeout ({missed} missed)");
                        }
                    }
                    let ping = OutboundFrame::correlated(RequestId::new(), Command::Ping {});
                    match ping.encode() {
                        Ok(text) => {
                            if let Err(err) = transport.send(text).await {
                                break format!("send failed: {err}");
                            }
                        }
                        Err(err) => warn!(error = %err, "ping encode failed"),
                    }
                }
            }
        };

        let _ = transport.close().await;
        self.connection_lost(&id, &reason);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

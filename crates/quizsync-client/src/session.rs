//! Session-level API over the connection.
//!
//! [`GameSessionClient`] turns session operations into commands. Correlated
//! operations (join, start, answers, host actions) suspend the caller until
//! the authority confirms, rejects, or the budget elapses; one-way
//! operations (leave, realtime broadcasts) are queued and forgotten, and
//! silently do nothing while disconnected.
//!
//! A command's result only confirms acceptance. State changes arrive as
//! broadcasts through the dispatcher, in no particular order relative to
//! the result.
//!
//! With `connection.offline` set the transport is never opened: correlated
//! operations succeed immediately and one-way operations are dropped.

use std::sync::Arc;
use std::time::Duration;

use quizsync_core::errors::{ClientError, Result};
use quizsync_core::ids::{ConnectionId, SubscriptionId};
use quizsync_core::model::{AnswerSubmission, ConnectionState};
use quizsync_core::protocol::{Command, OutboundFrame, SessionAction, SessionEvent, events};
use quizsync_settings::ClientSettings;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::correlator::{Operation, RequestCorrelator};
use crate::diagnostics::{self, DiagnosticsReport};
use crate::dispatcher::EventDispatcher;
use crate::mirror::SessionMirror;
use crate::transport::{Connector, WsConnector};

struct ClientInner {
    settings: ClientSettings,
    connection: ConnectionManager,
    correlator: Arc<RequestCorrelator>,
}

/// Client for one authority connection and any number of sessions on it.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct GameSessionClient {
    inner: Arc<ClientInner>,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ClientError::InvalidArgument(format!("{field} must not be empty")));
    }
    Ok(())
}

impl GameSessionClient {
    /// Client over WebSocket, using `settings` for every budget.
    pub fn new(settings: ClientSettings) -> Self {
        let connector = Arc::new(WsConnector::new(settings.connection.connect_timeout()));
        Self::with_connector(settings, connector)
    }

    /// Client over a caller-supplied transport.
    pub fn with_connector(settings: ClientSettings, connector: Arc<dyn Connector>) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = ConnectionManager::new(&settings, connector, dispatcher);
        let correlator = RequestCorrelator::attach(connection.clone());
        Self {
            inner: Arc::new(ClientInner {
                settings,
                connection,
                correlator,
            }),
        }
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Settings the client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// The underlying connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// The event dispatcher.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        self.inner.connection.dispatcher()
    }

    /// Whether the transport is disabled.
    pub fn is_offline(&self) -> bool {
        self.inner.settings.connection.offline
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Identity of the current connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.connection.connection_id()
    }

    /// Subscribe to an event or lifecycle notification.
    pub fn on<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.dispatcher().on(event, callback)
    }

    /// Remove a subscription.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.dispatcher().off(event, id)
    }

    /// Open the connection with `credential` (or the one given last time).
    pub async fn connect(&self, credential: Option<String>) -> Result<()> {
        if self.is_offline() {
            debug!("offline; connect skipped");
            return Ok(());
        }
        self.inner.connection.connect(credential).await
    }

    /// Close the connection and drop every subscription.
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    /// Resolve once connected. Immediate when offline.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        if self.is_offline() {
            return Ok(());
        }
        self.inner.connection.wait_for_connection(timeout).await
    }

    /// Reconnect with the last credential and a fresh attempt budget.
    pub async fn reconnect_manually(&self) -> Result<()> {
        if self.is_offline() {
            return Ok(());
        }
        self.inner.connection.reconnect_manually().await
    }

    /// Snapshot the connection and ping the authority.
    pub async fn perform_diagnostics(&self) -> DiagnosticsReport {
        diagnostics::run(
            &self.inner.connection,
            &self.inner.correlator,
            self.inner.settings.heartbeat.diagnostic_timeout(),
            self.is_offline(),
        )
        .await
    }

    /// Operations bound to one session.
    pub fn session(&self, session_id: impl Into<String>) -> SessionHandle {
        SessionHandle {
            client: self.clone(),
            session_id: session_id.into(),
        }
    }

    // ── Correlated operations ───────────────────────────────────────

    async fn perform(&self, op: Operation) -> Result<bool> {
        if self.is_offline() {
            debug!(operation = op.name(), "offline; synthetic success");
            return Ok(true);
        }
        self.inner.correlator.perform(op).await.map(|_| true)
    }

    /// Join `session_id` as `user_id`. Resolves `true` on `session.joined`.
    pub async fn join(&self, session_id: &str, user_id: &str) -> Result<bool> {
        require("sessionId", session_id)?;
        require("userId", user_id)?;
        info!(session_id, user_id, "joining");
        let timeouts = &self.inner.settings.timeouts;
        let op = Operation::new(
            "join",
            Command::Join {
                session_id: session_id.to_owned(),
                user_id: user_id.to_owned(),
            },
            timeouts.join(),
        )
        .succeeds_on(events::JOINED)
        .fails_on(events::ERROR);
        self.perform(op).await
    }

    /// Start the session. Resolves `true` on `session.started`.
    pub async fn start(&self, session_id: &str) -> Result<bool> {
        require("sessionId", session_id)?;
        info!(session_id, "starting");
        let op = Operation::new(
            "start",
            Command::Start {
                session_id: session_id.to_owned(),
            },
            self.inner.settings.timeouts.start(),
        )
        .succeeds_on(events::STARTED)
        .fails_on(events::ERROR);
        self.perform(op).await
    }

    /// Submit an answer. Resolves `true` on `session.answer_recorded`.
    ///
    /// Never retried automatically: a timeout means the outcome is
    /// unknown and the answer may have been recorded.
    pub async fn submit_answer(&self, session_id: &str, submission: AnswerSubmission) -> Result<bool> {
        require("sessionId", session_id)?;
        require("questionId", &submission.question_id)?;
        debug!(session_id, question_id = %submission.question_id, elapsed_ms = submission.elapsed_ms, "submitting answer");
        let question_id = submission.question_id.clone();
        let op = Operation::new(
            "submit_answer",
            Command::answer(session_id, submission),
            self.inner.settings.timeouts.answer(),
        )
        .succeeds_on(events::ANSWER_RECORDED)
        .fails_on(events::ERROR)
        .identity("questionId", question_id);
        self.perform(op).await
    }

    async fn action(&self, session_id: &str, action: SessionAction, payload: Option<Value>) -> Result<bool> {
        require("sessionId", session_id)?;
        info!(session_id, action = action.as_str(), "session action");
        let timeouts = &self.inner.settings.timeouts;
        let op = Operation::new(
            action.as_str(),
            Command::Action {
                session_id: session_id.to_owned(),
                action,
                payload,
            },
            timeouts.action(),
        )
        .fails_on(events::ERROR)
        .identity("action", action.as_str())
        .acknowledged(timeouts.action_grace());
        self.perform(op).await
    }

    /// Pause the session (host).
    pub async fn pause(&self, session_id: &str) -> Result<bool> {
        self.action(session_id, SessionAction::Pause, None).await
    }

    /// Resume a paused session (host).
    pub async fn resume(&self, session_id: &str) -> Result<bool> {
        self.action(session_id, SessionAction::Resume, None).await
    }

    /// Skip the current question (host).
    pub async fn skip_question(&self, session_id: &str) -> Result<bool> {
        self.action(session_id, SessionAction::SkipQuestion, None).await
    }

    /// End the session (host).
    pub async fn end_game(&self, session_id: &str) -> Result<bool> {
        self.action(session_id, SessionAction::EndGame, None).await
    }

    /// Ask for a hint, optionally of a specific kind.
    pub async fn request_hint(&self, session_id: &str, hint_type: Option<&str>) -> Result<bool> {
        let payload = hint_type.map(|t| json!({"hintType": t}));
        self.action(session_id, SessionAction::HintRequest, payload).await
    }

    // ── One-way operations ──────────────────────────────────────────

    fn send_one_way(&self, command: Command) {
        if self.is_offline() {
            return;
        }
        let name = command.name();
        match self.inner.connection.send_frame(&OutboundFrame::one_way(command)) {
            Ok(()) => debug!(command = name, "sent"),
            Err(ClientError::NotConnected | ClientError::ReconnectExhausted { .. }) => {
                debug!(command = name, "not connected; dropped");
            }
            Err(err) => warn!(command = name, error = %err, "send failed"),
        }
    }

    /// Leave the session. Best-effort; nothing happens while disconnected.
    pub fn leave(&self, session_id: &str, user_id: &str) {
        info!(session_id, user_id, "leaving");
        self.send_one_way(Command::Leave {
            session_id: session_id.to_owned(),
            user_id: user_id.to_owned(),
        });
    }

    /// Relay an application-defined event to the other participants.
    pub fn broadcast_realtime_event(&self, session_id: &str, event_type: &str, data: Value) {
        self.send_one_way(Command::Broadcast {
            session_id: session_id.to_owned(),
            event_type: event_type.to_owned(),
            event_data: data,
        });
    }

    /// Broadcast format-specific data as `<format>_data`.
    pub fn send_game_specific_data(&self, session_id: &str, format: &str, data: Value) {
        self.broadcast_realtime_event(session_id, &format!("{format}_data"), data);
    }

    /// Broadcast a position update.
    pub fn send_player_movement(&self, session_id: &str, position: Value) {
        self.broadcast_realtime_event(session_id, "player_movement", position);
    }

    /// Broadcast a chat line.
    pub fn send_chat_message(&self, session_id: &str, message: &str) {
        self.broadcast_realtime_event(session_id, "chat_message", json!({"message": message}));
    }

    /// Broadcast a reaction (emoji or short code).
    pub fn send_reaction(&self, session_id: &str, reaction: &str) {
        self.broadcast_realtime_event(session_id, "player_reaction", json!({"reaction": reaction}));
    }
}

impl std::fmt::Debug for GameSessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameSessionClient")
            .field("connection", &self.inner.connection)
            .field("offline", &self.is_offline())
            .finish_non_exhaustive()
    }
}

/// [`GameSessionClient`] operations with the session id bound.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    client: GameSessionClient,
    session_id: String,
}

impl SessionHandle {
    /// The bound session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The client this handle was created from.
    pub fn client(&self) -> &GameSessionClient {
        &self.client
    }

    /// See [`GameSessionClient::join`].
    pub async fn join(&self, user_id: &str) -> Result<bool> {
        self.client.join(&self.session_id, user_id).await
    }

    /// See [`GameSessionClient::leave`].
    pub fn leave(&self, user_id: &str) {
        self.client.leave(&self.session_id, user_id);
    }

    /// See [`GameSessionClient::start`].
    pub async fn start(&self) -> Result<bool> {
        self.client.start(&self.session_id).await
    }

    /// See [`GameSessionClient::submit_answer`].
    pub async fn submit_answer(&self, submission: AnswerSubmission) -> Result<bool> {
        self.client.submit_answer(&self.session_id, submission).await
    }

    /// See [`GameSessionClient::pause`].
    pub async fn pause(&self) -> Result<bool> {
        self.client.pause(&self.session_id).await
    }

    /// See [`GameSessionClient::resume`].
    pub async fn resume(&self) -> Result<bool> {
        self.client.resume(&self.session_id).await
    }

    /// See [`GameSessionClient::skip_question`].
    pub async fn skip_question(&self) -> Result<bool> {
        self.client.skip_question(&self.session_id).await
    }

    /// See [`GameSessionClient::end_game`].
    pub async fn end_game(&self) -> Result<bool> {
        self.client.end_game(&self.session_id).await
    }

    /// See [`GameSessionClient::request_hint`].
    pub async fn request_hint(&self, hint_type: Option<&str>) -> Result<bool> {
        self.client.request_hint(&self.session_id, hint_type).await
    }

    /// See [`GameSessionClient::broadcast_realtime_event`].
    pub fn broadcast(&self, event_type: &str, data: Value) {
        self.client.broadcast_realtime_event(&self.session_id, event_type, data);
    }

    /// See [`GameSessionClient::send_game_specific_data`].
    pub fn send_game_specific_data(&self, format: &str, data: Value) {
        self.client.send_game_specific_data(&self.session_id, format, data);
    }

    /// See [`GameSessionClient::send_player_movement`].
    pub fn send_player_movement(&self, position: Value) {
        self.client.send_player_movement(&self.session_id, position);
    }

    /// See [`GameSessionClient::send_chat_message`].
    pub fn send_chat_message(&self, message: &str) {
        self.client.send_chat_message(&self.session_id, message);
    }

    /// See [`GameSessionClient::send_reaction`].
    pub fn send_reaction(&self, reaction: &str) {
        self.client.send_reaction(&self.session_id, reaction);
    }

    /// Mirror this session's broadcasts into a local snapshot.
    pub fn mirror(&self, local_user: Option<&str>) -> SessionMirror {
        SessionMirror::attach(
            Arc::clone(self.client.dispatcher()),
            self.session_id.clone(),
            local_user.map(str::to_owned),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

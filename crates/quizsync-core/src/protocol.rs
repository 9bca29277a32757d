//! Wire-format types for the session synchronization protocol.
//!
//! Every frame is a JSON text frame. Outbound frames carry a command:
//!
//! ```json
//! {"id": "req_…", "type": "session.join", "data": {"sessionId": "s", "userId": "u"}}
//! ```
//!
//! `id` is present only on correlated commands. Inbound frames carry an
//! event pushed by the session authority:
//!
//! ```json
//! {"type": "session.joined", "sessionId": "s", "replyTo": "req_…", "data": {}}
//! ```
//!
//! Runtime lifecycle notifications (`connected`, `disconnected`, …) reuse
//! the same [`SessionEvent`] shape so subscribers handle one type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ClientError;
use crate::ids::RequestId;
use crate::model::{AnswerSubmission, AnswerValue};

/// Outbound command names.
pub mod commands {
    /// Join a session as a participant.
    pub const JOIN: &str = "session.join";
    /// Leave a session.
    pub const LEAVE: &str = "session.leave";
    /// Start a session (host only).
    pub const START: &str = "session.start";
    /// Submit an answer.
    pub const ANSWER: &str = "session.answer";
    /// Generic host/participant action.
    pub const ACTION: &str = "session.action";
    /// Fire-and-forget realtime relay.
    pub const BROADCAST: &str = "session.broadcast";
    /// Liveness probe.
    pub const PING: &str = "heartbeat.ping";
}

/// Inbound event names emitted by the session authority.
#[allow(missing_docs)]
pub mod events {
    pub const JOINED: &str = "session.joined";
    pub const RECONNECTED: &str = "session.reconnected";
    pub const ERROR: &str = "session.error";
    pub const WARNING: &str = "session.warning";
    pub const PARTICIPANT_UPDATED: &str = "participant.updated";
    pub const PARTICIPANT_LEFT: &str = "participant.left";
    pub const PARTICIPANT_DISCONNECTED: &str = "participant.disconnected";
    pub const PARTICIPANT_ANSWERED: &str = "participant.answered";
    pub const STARTED: &str = "session.started";
    pub const QUESTION: &str = "session.question";
    pub const ANSWER_RECORDED: &str = "session.answer_recorded";
    pub const LEADERBOARD: &str = "session.leaderboard";
    pub const ENDED: &str = "session.ended";
    pub const PAUSED: &str = "session.paused";
    pub const RESUMED: &str = "session.resumed";
    pub const STATE_SYNC: &str = "session.state_sync";
    pub const HOST_MESSAGE: &str = "session.host_message";
    pub const TIME_UPDATE: &str = "session.time_update";
    pub const REALTIME_EVENT: &str = "session.realtime_event";
    pub const ACTION_ACK: &str = "session.action_ack";
    pub const PONG: &str = "heartbeat.pong";

    /// Every event name the authority is known to emit.
    pub const ALL: &[&str] = &[
        JOINED,
        RECONNECTED,
        ERROR,
        WARNING,
        PARTICIPANT_UPDATED,
        PARTICIPANT_LEFT,
        PARTICIPANT_DISCONNECTED,
        PARTICIPANT_ANSWERED,
        STARTED,
        QUESTION,
        ANSWER_RECORDED,
        LEADERBOARD,
        ENDED,
        PAUSED,
        RESUMED,
        STATE_SYNC,
        HOST_MESSAGE,
        TIME_UPDATE,
        REALTIME_EVENT,
        ACTION_ACK,
        PONG,
    ];
}

/// Local lifecycle event names emitted by the runtime itself.
pub mod lifecycle {
    /// A connection was established.
    pub const CONNECTED: &str = "connected";
    /// The connection closed (gracefully or not).
    pub const DISCONNECTED: &str = "disconnected";
    /// A connect attempt failed.
    pub const CONNECTION_ERROR: &str = "connectionError";
    /// A reconnect attempt has been scheduled.
    pub const RECONNECTING: &str = "reconnecting";
    /// The automatic reconnect budget is exhausted.
    pub const MAX_RECONNECT_ATTEMPTS_REACHED: &str = "maxReconnectAttemptsReached";
    /// A heartbeat interval passed without a pong.
    pub const HEARTBEAT_MISSED: &str = "heartbeatMissed";
    /// A malformed or unreadable frame arrived.
    pub const SOCKET_ERROR: &str = "socketError";
}

/// Host/participant actions carried by `session.action`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    /// Pause the running session.
    Pause,
    /// Resume a paused session.
    Resume,
    /// Advance to the next question.
    SkipQuestion,
    /// Terminate the session.
    EndGame,
    /// Ask for a hint on the current question.
    HintRequest,
}

impl SessionAction {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::SkipQuestion => "skip_question",
            Self::EndGame => "end_game",
            Self::HintRequest => "hint_request",
        }
    }
}

/// A command sent to the session authority.
///
/// Serialized adjacently tagged so the variant becomes `type` and the
/// fields become `data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    /// `session.join`
    #[serde(rename = "session.join", rename_all = "camelCase")]
    Join {
        /// Target session.
        session_id: String,
        /// Joining user.
        user_id: String,
    },
    /// `session.leave`
    #[serde(rename = "session.leave", rename_all = "camelCase")]
    Leave {
        /// Session being left.
        session_id: String,
        /// Leaving user.
        user_id: String,
    },
    /// `session.start`
    #[serde(rename = "session.start", rename_all = "camelCase")]
    Start {
        /// Session to start.
        session_id: String,
    },
    /// `session.answer`
    #[serde(rename = "session.answer", rename_all = "camelCase")]
    Answer {
        /// Session the question belongs to.
        session_id: String,
        /// Answered question.
        question_id: String,
        /// Submitted value.
        answer: AnswerValue,
        /// Time the participant took, in milliseconds.
        elapsed_ms: u64,
        /// Per-format auxiliary payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<Value>,
    },
    /// `session.action`
    #[serde(rename = "session.action", rename_all = "camelCase")]
    Action {
        /// Target session.
        session_id: String,
        /// Requested action.
        action: SessionAction,
        /// Optional action parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// `session.broadcast`
    #[serde(rename = "session.broadcast", rename_all = "camelCase")]
    Broadcast {
        /// Target session.
        session_id: String,
        /// Application-defined event type.
        event_type: String,
        /// Application-defined payload.
        event_data: Value,
    },
    /// `heartbeat.ping`
    #[serde(rename = "heartbeat.ping")]
    Ping {},
}

impl Command {
    /// Build an answer command from a submission.
    pub fn answer(session_id: impl Into<String>, submission: AnswerSubmission) -> Self {
        Self::Answer {
            session_id: session_id.into(),
            question_id: submission.question_id,
            answer: submission.answer,
            elapsed_ms: submission.elapsed_ms,
            extra: submission.extra,
        }
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => commands::JOIN,
            Self::Leave { .. } => commands::LEAVE,
            Self::Start { .. } => commands::START,
            Self::Answer { .. } => commands::ANSWER,
            Self::Action { .. } => commands::ACTION,
            Self::Broadcast { .. } => commands::BROADCAST,
            Self::Ping {} => commands::PING,
        }
    }

    /// Session the command targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Join { session_id, .. }
            | Self::Leave { session_id, .. }
            | Self::Start { session_id }
            | Self::Answer { session_id, .. }
            | Self::Action { session_id, .. }
            | Self::Broadcast { session_id, .. } => Some(session_id),
            Self::Ping {} => None,
        }
    }
}

/// An outbound frame: a command plus an optional correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Correlation id, echoed by the authority as `replyTo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// The command.
    #[serde(flatten)]
    pub command: Command,
}

impl OutboundFrame {
    /// A correlated frame.
    pub fn correlated(id: RequestId, command: Command) -> Self {
        Self {
            id: Some(id),
            command,
        }
    }

    /// A one-way frame.
    pub fn one_way(command: Command) -> Self {
        Self { id: None, command }
    }

    /// Serialize to JSON text.
    pub fn encode(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

/// An event pushed by the authority, or a local lifecycle notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Event name (e.g. `session.joined`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Session the event belongs to, if the authority tagged it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// ISO-8601 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Correlation id of the command this event answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<RequestId>,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl SessionEvent {
    /// Create an event with the given payload.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: None,
            timestamp: None,
            reply_to: None,
            data,
        }
    }

    /// Create a local lifecycle event stamped with the current UTC time.
    pub fn lifecycle(event_type: &str, data: Value) -> Self {
        Self {
            timestamp: Some(now_rfc3339()),
            ..Self::new(event_type, data)
        }
    }

    /// Tag the event with a session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Mark the event as the reply to a correlated command.
    #[must_use]
    pub fn replying_to(mut self, id: RequestId) -> Self {
        self.reply_to = Some(id);
        self
    }

    /// Parse an inbound text frame.
    pub fn decode(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Serialize to JSON text.
    pub fn encode(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Whether the event has the given name.
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// String field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Session id from the envelope, falling back to the payload.
    pub fn session(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or_else(|| self.data_str("sessionId"))
    }

    /// Value of an identity key (`sessionId`, `questionId`, …).
    pub fn identity(&self, key: &str) -> Option<&str> {
        if key == "sessionId" {
            self.session()
        } else {
            self.data_str(key)
        }
    }

    /// Error text carried by `session.error` / `session.action_ack`.
    pub fn message(&self) -> Option<&str> {
        self.data_str("message")
    }
}

/// Current UTC time formatted the way the authority stamps events.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

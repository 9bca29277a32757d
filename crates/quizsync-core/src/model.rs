//! Data model shared between the runtime and its subscribers.
//!
//! The session authority owns [`SessionSnapshot`]; the client only folds
//! broadcast deltas into a local copy. [`AnswerSubmission`] is created by a
//! participant action and is immutable once sent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Lifecycle state of the single client connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The connection is established.
    Connected,
    /// A reconnect attempt is scheduled and waiting out its delay.
    Reconnecting,
    /// The last attempt failed, or the reconnect budget is exhausted.
    Error,
}

impl ConnectionState {
    /// Wire/display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a game session as reported by the authority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Lobby open, not started.
    #[default]
    Waiting,
    /// Questions are being played.
    Active,
    /// Host paused the session.
    Paused,
    /// Session ended normally.
    Finished,
    /// Session was cancelled.
    Cancelled,
}

/// One participant in a session roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// User identity.
    pub user_id: String,
    /// Display name, when the authority provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Running score.
    #[serde(default)]
    pub score: i64,
    /// Last time the authority saw this participant (ISO-8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    /// Whether the participant is currently connected.
    #[serde(default = "default_true")]
    pub connected: bool,
}

fn default_true() -> bool {
    true
}

impl Participant {
    /// A connected participant with zero score.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            score: 0,
            last_seen: None,
            connected: true,
        }
    }
}

/// A question as broadcast by the authority. Only the id is interpreted;
/// the rest is format-specific.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Question identity.
    pub id: String,
    /// Format-specific fields.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Authority-owned session state, folded locally from broadcasts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSnapshot {
    /// Session identity.
    pub session_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Ordered question list (as far as it is known locally).
    pub questions: Vec<Question>,
    /// Index of the current question, once one has been asked.
    pub current_question_index: Option<usize>,
    /// Roster with scores and connection flags.
    pub participants: Vec<Participant>,
}

impl SessionSnapshot {
    /// Empty snapshot for a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Look up a participant.
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Look up a participant mutably, inserting a fresh entry if absent.
    pub fn participant_mut(&mut self, user_id: &str) -> &mut Participant {
        let idx = match self.participants.iter().position(|p| p.user_id == user_id) {
            Some(idx) => idx,
            None => {
                self.participants.push(Participant::new(user_id));
                self.participants.len() - 1
            }
        };
        &mut self.participants[idx]
    }

    /// Number of connected participants.
    pub fn connected_count(&self) -> usize {
        self.participants.iter().filter(|p| p.connected).count()
    }
}

/// A submitted answer: a scalar or an ordered choice list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    /// Free text or a single choice label.
    Text(String),
    /// Numeric answer.
    Number(Number),
    /// True/false answer.
    Bool(bool),
    /// Ordered choices (sorting, sequencing formats).
    Choices(Vec<AnswerValue>),
}

impl From<&str> for AnswerValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for AnswerValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for AnswerValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<bool> for AnswerValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<AnswerValue>> From<Vec<T>> for AnswerValue {
    fn from(items: Vec<T>) -> Self {
        Self::Choices(items.into_iter().map(Into::into).collect())
    }
}

/// One answer from one participant to one question.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    /// Answered question.
    pub question_id: String,
    /// Submitted value.
    pub answer: AnswerValue,
    /// Time taken, in milliseconds.
    pub elapsed_ms: u64,
    /// Per-format auxiliary payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl AnswerSubmission {
    /// Create a submission without auxiliary data.
    pub fn new(question_id: impl Into<String>, answer: impl Into<AnswerValue>, elapsed_ms: u64) -> Self {
        Self {
            question_id: question_id.into(),
            answer: answer.into(),
            elapsed_ms,
            extra: None,
        }
    }

    /// Attach a per-format payload.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

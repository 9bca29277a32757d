//! Error taxonomy for the session synchronization runtime.
//!
//! [`ClientError`] covers every failure a caller can observe:
//!
//! - command-level failures (`NotConnected`, `Timeout`, `Rejected`,
//!   `InvalidArgument`) are returned from the operation that caused them;
//! - connection-level failures (`Connection`, `Transport`,
//!   `MissingCredential`) are returned from connect calls and also surface
//!   as dispatcher lifecycle events;
//! - `ReconnectExhausted` replaces `NotConnected` for commands issued after
//!   automatic reconnection gave up.
//!
//! [`ClientError::outcome`] maps each variant to what a UI should tell the
//! user: the action failed, its outcome is unknown, or the client is offline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the client runtime.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// A correlated command was issued while the connection was not
    /// `connected`. Nothing was sent.
    #[error("not connected")]
    NotConnected,

    /// No matching acknowledgment arrived within the operation budget.
    /// The authority may still have processed the command.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation name (e.g. `join`).
        operation: String,
        /// Budget that elapsed.
        after: Duration,
    },

    /// The session authority explicitly rejected the command.
    #[error("{message}")]
    Rejected {
        /// Operation name (e.g. `start`).
        operation: String,
        /// Authority-supplied message, passed through verbatim.
        message: String,
    },

    /// A caller-supplied argument failed validation. Nothing was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No credential was available while one is required.
    #[error("missing credential")]
    MissingCredential,

    /// The established transport failed while sending or receiving.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The automatic reconnect budget is spent; only a manual connect recovers.
    #[error("max reconnect attempts reached ({attempts})")]
    ReconnectExhausted {
        /// Number of automatic attempts made.
        attempts: u32,
    },
}

/// What the caller should conclude about a failed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The command definitely did not take effect; retrying is safe.
    Failed,
    /// The command may or may not have taken effect.
    Unknown,
    /// The client is offline; nothing was sent.
    Offline,
}

impl ClientError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Timeout { .. } => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Connection(_) => "connection",
            Self::MissingCredential => "missing_credential",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }

    /// Map to the user-visible outcome class.
    pub fn outcome(&self) -> CommandOutcome {
        match self {
            Self::Rejected { .. } | Self::InvalidArgument(_) | Self::Protocol(_) => {
                CommandOutcome::Failed
            }
            Self::Timeout { .. } => CommandOutcome::Unknown,
            Self::NotConnected
            | Self::Connection(_)
            | Self::MissingCredential
            | Self::Transport(_)
            | Self::ReconnectExhausted { .. } => CommandOutcome::Offline,
        }
    }

    /// Whether a blind retry cannot cause a duplicate submission.
    pub fn is_retry_safe(&self) -> bool {
        self.outcome() != CommandOutcome::Unknown
    }

    /// Whether this error belongs to the connection rather than to one command.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::MissingCredential
                | Self::Transport(_)
                | Self::ReconnectExhausted { .. }
        )
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn rejected_displays_authority_message_verbatim() {
        let err = ClientError::Rejected {
            operation: "join".into(),
            message: "Game session not found".into(),
        };
        assert_eq!(err.to_string(), "Game session not found");
    }

    #[test]
    fn timeout_display_names_operation() {
        let err = ClientError::Timeout {
            operation: "submit_answer".into(),
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "submit_answer timed out after 10s");
    }

    #[test]
    fn outcome_classification() {
        assert_eq!(ClientError::NotConnected.outcome(), CommandOutcome::Offline);
        assert_eq!(
            ClientError::Timeout {
                operation: "x".into(),
                after: Duration::from_secs(1)
            }
            .outcome(),
            CommandOutcome::Unknown
        );
        assert_eq!(
            ClientError::Rejected {
                operation: "x".into(),
                message: "no".into()
            }
            .outcome(),
            CommandOutcome::Failed
        );
        assert_eq!(
            ClientError::ReconnectExhausted { attempts: 5 }.outcome(),
            CommandOutcome::Offline
        );
    }

    #[test]
    fn timeout_is_not_retry_safe() {
        let err = ClientError::Timeout {
            operation: "submit_answer".into(),
            after: Duration::from_secs(10),
        };
        assert!(!err.is_retry_safe());
        assert!(ClientError::NotConnected.is_retry_safe());
    }

    #[test]
    fn connection_level_errors() {
        assert!(ClientError::Connection("refused".into()).is_connection_level());
        assert!(ClientError::MissingCredential.is_connection_level());
        assert!(!ClientError::NotConnected.is_connection_level());
        assert!(!ClientError::InvalidArgument("x".into()).is_connection_level());
    }

    #[test]
    fn kind_strings() {
        assert_eq!(ClientError::NotConnected.kind(), "not_connected");
        assert_eq!(
            ClientError::ReconnectExhausted { attempts: 5 }.kind(),
            "reconnect_exhausted"
        );
        assert_matches!(
            ClientError::Protocol("bad".into()),
            ClientError::Protocol(ref m) if m == "bad"
        );
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&CommandOutcome::Unknown).unwrap();
        assert_eq!(json, "\"unknown\"");
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may name only the values it changes. Each type
//! implements [`Default`] with the production defaults.

use std::time::Duration;

use quizsync_core::backoff::{
    BackoffKind, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the client runtime.
///
/// ```json
/// {
///   "connection": { "url": "wss://quiz.example.com/ws" },
///   "reconnect": { "backoff": "exponential" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Endpoint and credential policy.
    pub connection: ConnectionSettings,
    /// Automatic reconnection policy.
    pub reconnect: ReconnectSettings,
    /// Liveness probing.
    pub heartbeat: HeartbeatSettings,
    /// Per-operation acknowledgment budgets.
    pub timeouts: TimeoutSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl ClientSettings {
    /// Reject combinations the runtime cannot honor.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        let url = self.connection.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.url must use ws:// or wss://, got {url:?}"
            )));
        }
        let nonzero = [
            ("connection.connectTimeoutMs", self.connection.connect_timeout_ms),
            ("reconnect.baseDelayMs", self.reconnect.base_delay_ms),
            ("heartbeat.intervalMs", self.heartbeat.interval_ms),
            ("heartbeat.diagnosticTimeoutMs", self.heartbeat.diagnostic_timeout_ms),
            ("timeouts.joinMs", self.timeouts.join_ms),
            ("timeouts.startMs", self.timeouts.start_ms),
            ("timeouts.answerMs", self.timeouts.answer_ms),
            ("timeouts.actionMs", self.timeouts.action_ms),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(SettingsError::InvalidValue(
                "reconnect.maxDelayMs must be >= reconnect.baseDelayMs".to_string(),
            ));
        }
        if self.timeouts.action_grace_ms >= self.timeouts.action_ms {
            return Err(SettingsError::InvalidValue(
                "timeouts.actionGraceMs must be < timeouts.actionMs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Endpoint and credential policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint of the session authority.
    pub url: String,
    /// Budget for a single connect attempt (TCP + handshake).
    pub connect_timeout_ms: u64,
    /// Fail connects that have no credential instead of connecting anonymously.
    pub require_credential: bool,
    /// Disable the transport entirely; commands resolve with synthetic success.
    pub offline: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/ws".to_string(),
            connect_timeout_ms: 20_000,
            require_credential: true,
            offline: false,
        }
    }
}

impl ConnectionSettings {
    /// Connect attempt budget.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Automatic reconnection policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Automatic attempts before giving up (0 disables reconnection).
    pub max_attempts: u32,
    /// Delay unit for the backoff curve.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Backoff curve.
    pub backoff: BackoffKind,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff: BackoffKind::Linear,
        }
    }
}

impl ReconnectSettings {
    /// Delay before automatic attempt `attempt` (one-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        quizsync_core::backoff::reconnect_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.backoff,
        )
    }
}

/// Liveness probing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Interval between pings while connected.
    pub interval_ms: u64,
    /// Consecutive misses that force a reconnect (0 = report only).
    pub max_missed: u32,
    /// Budget for the diagnostic ping round-trip.
    pub diagnostic_timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_missed: 3,
            diagnostic_timeout_ms: 5000,
        }
    }
}

impl HeartbeatSettings {
    /// Ping interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Diagnostic ping budget.
    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostic_timeout_ms)
    }
}

/// Per-operation acknowledgment budgets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// `join` budget.
    pub join_ms: u64,
    /// `start` budget.
    pub start_ms: u64,
    /// `submit_answer` budget.
    pub answer_ms: u64,
    /// Host/participant action budget.
    pub action_ms: u64,
    /// Delay after which an unacknowledged action resolves optimistically.
    pub action_grace_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            join_ms: 10_000,
            start_ms: 15_000,
            answer_ms: 10_000,
            action_ms: 10_000,
            action_grace_ms: 1000,
        }
    }
}

impl TimeoutSettings {
    /// `join` budget.
    pub fn join(&self) -> Duration {
        Duration::from_millis(self.join_ms)
    }
    /// `start` budget.
    pub fn start(&self) -> Duration {
        Duration::from_millis(self.start_ms)
    }
    /// `submit_answer` budget.
    pub fn answer(&self) -> Duration {
        Duration::from_millis(self.answer_ms)
    }
    /// Action budget.
    pub fn action(&self) -> Duration {
        Duration::from_millis(self.action_ms)
    }
    /// Optimistic grace delay.
    pub fn action_grace(&self) -> Duration {
        Duration::from_millis(self.action_grace_ms)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`..`error`), or an `EnvFilter` directive.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: quizsync_core::logging::DEFAULT_LEVEL.to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Connection self-test.
//!
//! A [`DiagnosticsReport`] is a point-in-time snapshot of the connection
//! plus, when connected, one heartbeat round-trip under its own budget.

use std::time::Duration;

use chrono::{DateTime, Utc};
use quizsync_core::errors::ClientError;
use quizsync_core::ids::ConnectionId;
use quizsync_core::model::ConnectionState;
use quizsync_core::protocol::{Command, events};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::correlator::{Operation, RequestCorrelator};

/// Result of the diagnostic heartbeat round-trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PingOutcome {
    /// A pong arrived within budget.
    Success,
    /// No pong within budget.
    Timeout,
    /// No connection to ping over.
    NotConnected,
}

/// Snapshot returned by a diagnostics run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    /// Whether the connection was established when the run began.
    pub connected: bool,
    /// Connection state when the run began.
    pub state: ConnectionState,
    /// Current connection identity.
    pub connection_id: Option<ConnectionId>,
    /// Automatic reconnect attempts in the current cycle.
    pub reconnect_attempts: u32,
    /// Registered dispatcher callbacks.
    pub subscriber_count: usize,
    /// Correlated operations awaiting settlement.
    pub pending_operations: usize,
    /// Whether the transport is disabled.
    pub offline: bool,
    /// When the last heartbeat pong arrived.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Round-trip result.
    pub ping: PingOutcome,
    /// Round-trip time, on success.
    pub round_trip_ms: Option<u64>,
}

pub(crate) async fn run(
    connection: &ConnectionManager,
    correlator: &RequestCorrelator,
    timeout: Duration,
    offline: bool,
) -> DiagnosticsReport {
    let state = connection.state();
    let mut report = DiagnosticsReport {
        connected: !offline && state == ConnectionState::Connected,
        state,
        connection_id: connection.connection_id(),
        reconnect_attempts: connection.reconnect_attempts(),
        subscriber_count: connection.dispatcher().subscriber_count(),
        pending_operations: correlator.pending_count(),
        offline,
        last_heartbeat: connection.last_heartbeat(),
        timestamp: Utc::now(),
        ping: PingOutcome::NotConnected,
        round_trip_ms: None,
    };
    if !report.connected {
        return report;
    }

    let started = Instant::now();
    let op = Operation::new("ping", Command::Ping {}, timeout).succeeds_on(events::PONG);
    match correlator.perform(op).await {
        Ok(_) => {
            let rtt = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            info!(rtt_ms = rtt, "diagnostic ping ok");
            report.ping = PingOutcome::Success;
            report.round_trip_ms = Some(rtt);
            report.last_heartbeat = connection.last_heartbeat();
        }
        Err(ClientError::Timeout { .. }) => {
            warn!(after = ?timeout, "diagnostic ping timed out");
            report.ping = PingOutcome::Timeout;
        }
        Err(err) => {
            warn!(error = %err, "diagnostic ping failed");
            report.ping = PingOutcome::NotConnected;
        }
    }
    report
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

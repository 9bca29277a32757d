//! Reconnect delay calculation.
//!
//! Pure math with no runtime dependency; the connection manager in
//! `quizsync-client` feeds the result into `tokio::time::sleep`.
//!
//! - [`BackoffKind::Linear`]: `base * attempt` (the default)
//! - [`BackoffKind::Exponential`]: `base * 2^(attempt - 1)`
//!
//! Both are capped at a maximum delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default automatic reconnect budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Growth curve for successive reconnect delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base * attempt`.
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Delay in milliseconds before reconnect attempt `attempt`.
///
/// `attempt` is one-based; zero is treated as one so a caller that has not
/// yet incremented its counter still waits the base delay.
#[must_use]
pub fn reconnect_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, kind: BackoffKind) -> u64 {
    let attempt = attempt.max(1);
    let raw = match kind {
        BackoffKind::Linear => base_delay_ms.saturating_mul(u64::from(attempt)),
        BackoffKind::Exponential => {
            base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(31))
        }
    };
    raw.min(max_delay_ms)
}

/// [`reconnect_delay_ms`] as a [`Duration`].
#[must_use]
pub fn reconnect_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, kind: BackoffKind) -> Duration {
    Duration::from_millis(reconnect_delay_ms(attempt, base_delay_ms, max_delay_ms, kind))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

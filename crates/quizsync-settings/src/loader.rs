//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.quizsync/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `QUIZSYNC_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ClientSettings;

/// Environment variable naming the authority endpoint.
pub const ENV_URL: &str = "QUIZSYNC_URL";
/// Environment variable toggling offline mode.
pub const ENV_OFFLINE: &str = "QUIZSYNC_OFFLINE";
/// Environment variable overriding the reconnect budget.
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "QUIZSYNC_MAX_RECONNECT_ATTEMPTS";
/// Environment variable overriding the reconnect base delay.
pub const ENV_RECONNECT_DELAY_MS: &str = "QUIZSYNC_RECONNECT_DELAY_MS";
/// Environment variable overriding the heartbeat interval.
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "QUIZSYNC_HEARTBEAT_INTERVAL_MS";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "QUIZSYNC_LOG_LEVEL";

/// Resolve the path to the settings file (`~/.quizsync/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".quizsync").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON, or a merged result that
/// fails [`ClientSettings::validate`], is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value
/// stays in effect.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Split out from [`apply_env_overrides`] so tests need not mutate the
/// process environment.
pub fn apply_overrides_from<F>(settings: &mut ClientSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read(ENV_URL) {
        if v.starts_with("ws://") || v.starts_with("wss://") {
            settings.connection.url = v;
        } else {
            warn!(key = ENV_URL, value = %v, "env url is not ws:// or wss://, ignoring");
        }
    }
    if let Some(v) = read(ENV_OFFLINE) {
        match parse_bool(&v) {
            Some(b) => settings.connection.offline = b,
            None => warn!(key = ENV_OFFLINE, value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_MAX_RECONNECT_ATTEMPTS) {
        match parse_u32_range(&v, 0, 100) {
            Some(n) => settings.reconnect.max_attempts = n,
            None => warn!(key = ENV_MAX_RECONNECT_ATTEMPTS, value = %v, "invalid u32 env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_RECONNECT_DELAY_MS) {
        // capped at reconnect.maxDelayMs
        match parse_u64_range(&v, 1, settings.reconnect.max_delay_ms) {
            Some(n) => settings.reconnect.base_delay_ms = n,
            None => warn!(key = ENV_RECONNECT_DELAY_MS, value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_HEARTBEAT_INTERVAL_MS) {
        match parse_u64_range(&v, 1000, 600_000) {
            Some(n) => settings.heartbeat.interval_ms = n,
            None => warn!(key = ENV_HEARTBEAT_INTERVAL_MS, value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_LOG_LEVEL) {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

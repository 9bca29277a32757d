//! # quizsync-settings
//!
//! Layered configuration for the quizsync client runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.quizsync/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `QUIZSYNC_*` overrides (highest priority)
//!
//! There is no process-wide instance. Callers load a [`ClientSettings`]
//! and hand it to the client they construct.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

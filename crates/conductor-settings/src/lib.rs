//! # conductor-settings
//!
//! Configuration with layered sources for the Conductor engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConductorSettings::default()`]
//! 2. **User file**: `~/.conductor/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CONDUCTOR_*` overrides (highest priority)
//!
//! Settings are read-only at runtime; nothing here writes the file back.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, load_with, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<ConductorSettings> = OnceLock::new();

/// Get the process-wide settings.
///
/// Loaded on first call; falls back to compiled defaults if loading fails.
pub fn get_settings() -> &'static ConductorSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            ConductorSettings::default()
        })
    })
}

/// Initialize the process-wide settings with a specific value.
///
/// Returns the value back if settings were already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: ConductorSettings) -> std::result::Result<(), ConductorSettings> {
    SETTINGS.set(settings)
}

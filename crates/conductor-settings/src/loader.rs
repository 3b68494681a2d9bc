//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConductorSettings::default()`]
//! 2. If `~/.conductor/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CONDUCTOR_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{ApprovalMode, ConductorSettings};

/// Resolve the path to the settings file (`~/.conductor/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conductor").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConductorSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; an unreadable or malformed file is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConductorSettings> {
    load_with(path, |name| std::env::var(name).ok())
}

/// Load from `path`, resolving overrides through `lookup` instead of the process env.
pub fn load_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ConductorSettings> {
    let defaults = serde_json::to_value(ConductorSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ConductorSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CONDUCTOR_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored (file/default value is kept).
pub fn apply_overrides(settings: &mut ConductorSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(val) = read("CONDUCTOR_MAX_ITERATIONS") {
        match parse_u32_range(&val, 1, 10_000) {
            Some(v) => settings.agent.max_iterations = v,
            None => warn!(key = "CONDUCTOR_MAX_ITERATIONS", value = %val, "invalid u32 env var, ignoring"),
        }
    }
    if let Some(val) = read("CONDUCTOR_APPROVAL_MODE") {
        match parse_approval_mode(&val) {
            Some(m) => settings.approval.mode = m,
            None => warn!(key = "CONDUCTOR_APPROVAL_MODE", value = %val, "invalid approval mode, ignoring"),
        }
    }
    if let Some(val) = read("CONDUCTOR_APPROVAL_TOOLS") {
        settings.approval.tools = val
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(val) = read("CONDUCTOR_APPROVAL_TIMEOUT_MS") {
        match parse_u64_range(&val, 1, 86_400_000) {
            Some(v) => settings.approval.timeout_ms = Some(v),
            None => warn!(key = "CONDUCTOR_APPROVAL_TIMEOUT_MS", value = %val, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(val) = read("CONDUCTOR_PAUSE_ON_STOP") {
        match parse_bool(&val) {
            Some(v) => settings.queue.pause_on_stop = v,
            None => warn!(key = "CONDUCTOR_PAUSE_ON_STOP", value = %val, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(val) = read("CONDUCTOR_LOG_LEVEL") {
        settings.logging.level = val;
    }
}

fn validate(settings: &ConductorSettings) -> Result<()> {
    if settings.agent.max_iterations == 0 {
        return Err(SettingsError::InvalidValue {
            key: "agent.maxIterations",
            reason: "must be at least 1",
        });
    }
    if settings.progress.channel_capacity == 0 {
        return Err(SettingsError::InvalidValue {
            key: "progress.channelCapacity",
            reason: "must be at least 1",
        });
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse an approval mode name.
pub fn parse_approval_mode(val: &str) -> Option<ApprovalMode> {
    match val.trim().to_lowercase().as_str() {
        "never" | "off" => Some(ApprovalMode::Never),
        "always" | "all" => Some(ApprovalMode::Always),
        "listed" => Some(ApprovalMode::Listed),
        _ => None,
    }
}

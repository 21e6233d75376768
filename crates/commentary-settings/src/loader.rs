//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CommentarySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COMMENTARY_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::CommentarySettings;

/// Env var naming an alternate settings file.
pub const SETTINGS_PATH_ENV: &str = "COMMENTARY_SETTINGS";

/// Resolve the settings file path.
///
/// `$COMMENTARY_SETTINGS` if set, otherwise `~/.commentary/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = read_env_string(SETTINGS_PATH_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".commentary").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CommentarySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CommentarySettings> {
    load_settings_with(path, read_env_string)
}

/// Load settings from `path`, resolving overrides through `lookup`.
pub fn load_settings_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<CommentarySettings> {
    let defaults = serde_json::to_value(CommentarySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CommentarySettings = serde_json::from_value(merged)?;
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

/// Apply `COMMENTARY_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_overrides(
    settings: &mut CommentarySettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = get("COMMENTARY_ENDPOINT") {
        settings.connection.endpoint = v;
    }
    if let Some(v) = get("COMMENTARY_TOKEN") {
        settings.connection.token = Some(v);
    }
    let heartbeat = parse_override(&get, "COMMENTARY_HEARTBEAT_INTERVAL_MS", |v| {
        parse_u64_range(v, 0, 600_000)
    });
    if let Some(n) = heartbeat {
        settings.connection.heartbeat_interval_ms = n;
    }
    let attempts = parse_override(&get, "COMMENTARY_MAX_RECONNECT_ATTEMPTS", |v| {
        parse_u32_range(v, 1, 1_000_000)
    });
    if let Some(n) = attempts {
        settings.connection.max_reconnect_attempts = Some(n);
    }
    let queued = parse_override(&get, "COMMENTARY_MAX_QUEUED_MESSAGES", |v| {
        parse_usize_range(v, 1, 1_000_000)
    });
    if let Some(n) = queued {
        settings.connection.max_queued_messages = n;
    }
    if let Some(v) = get("COMMENTARY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(b) = parse_override(&get, "COMMENTARY_LOG_JSON", parse_bool) {
        settings.logging.json = b;
    }
}

/// Reject settings the connection cannot run with.
pub fn validate(settings: &CommentarySettings) -> Result<()> {
    let endpoint = &settings.connection.endpoint;
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(SettingsError::InvalidValue(format!(
            "endpoint must use ws:// or wss://, got {endpoint}"
        )));
    }
    if settings.connection.max_queued_messages == 0 {
        return Err(SettingsError::InvalidValue(
            "maxQueuedMessages must be at least 1".to_string(),
        ));
    }
    Ok(())
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

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn parse_override<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = get(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "invalid env override, ignoring");
    }
    parsed
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TrenchSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `TRENCH_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::TrenchSettings;

/// Resolve the default settings file path (`~/.trench/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".trench").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TrenchSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, defaults are used. Invalid JSON and values
/// that fail [`TrenchSettings::validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<TrenchSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<TrenchSettings> {
    let defaults = serde_json::to_value(TrenchSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
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

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut TrenchSettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`.
///
/// Each key has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (file/default value stays)
pub fn apply_overrides(settings: &mut TrenchSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TRENCH_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.number("TRENCH_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = env.number("TRENCH_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = usize::try_from(v).unwrap_or(usize::MAX);
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.number("TRENCH_SEND_QUEUE_CAPACITY", 1, 65_536) {
        settings.connection.send_queue_capacity = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = env.number("TRENCH_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.connection.max_message_size = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = env.number("TRENCH_PONG_WAIT_MS", 1000, 3_600_000) {
        settings.connection.pong_wait_ms = v;
    }
    if let Some(v) = env.number("TRENCH_PING_INTERVAL_MS", 500, 3_600_000) {
        settings.connection.ping_interval_ms = v;
    }
    if let Some(v) = env.number("TRENCH_WRITE_WAIT_MS", 100, 600_000) {
        settings.connection.write_wait_ms = v;
    }
    if let Some(v) = env.boolean("TRENCH_COALESCE_FRAMES") {
        settings.connection.coalesce_frames = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.string("TRENCH_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = env.string("TRENCH_JWT_ISSUER") {
        settings.auth.issuer = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TRENCH_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("TRENCH_LOG_FORMAT") {
        match serde_json::from_value(Value::String(v.to_lowercase())) {
            Ok(format) => settings.logging.format = format,
            Err(_) => warn!(key = "TRENCH_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
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

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn number(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

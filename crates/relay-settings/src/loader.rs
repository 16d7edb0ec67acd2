//! Layered settings loading.
//!
//! 1. Compiled [`RelaySettings::default()`]
//! 2. `~/.relay/settings.json` (or an explicit path), deep-merged over defaults
//! 3. `RELAY_*` environment variables
//!
//! The merged result is validated before it is returned.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{ReauthPolicy, RelaySettings};

/// Path of the user settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load from [`settings_path`] with env overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides. A missing file yields defaults.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults plus file, no environment. Split out so tests stay hermetic.
fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

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

/// Merge `source` over `target`: objects recurse, everything else replaces,
/// and `null` in `source` leaves `target` untouched.
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

/// Apply `RELAY_*` overrides. Values that fail to parse are logged and skipped.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Override application against an arbitrary lookup.
pub fn apply_overrides_from(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.log_level.0 = v;
    }

    // ── Listeners ───────────────────────────────────────────────────
    let server = &mut settings.server;
    if let Some(v) = env.string("RELAY_HOST") {
        server.host = v;
    }
    if let Some(v) = env.bool("RELAY_TCP_ENABLED") {
        server.tcp_enabled = v;
    }
    if let Some(v) = env.u16("RELAY_TCP_PORT", 0, 65535) {
        server.tcp_port = v;
    }
    if let Some(v) = env.bool("RELAY_WS_ENABLED") {
        server.ws_enabled = v;
    }
    if let Some(v) = env.u16("RELAY_WS_PORT", 0, 65535) {
        server.ws_port = v;
    }
    if let Some(v) = env.usize("RELAY_MAX_CONNECTIONS", 1, 1_000_000) {
        server.max_connections = v;
    }
    if let Some(v) = env.usize("RELAY_MAX_FRAME_LEN", 64, 256 * 1024 * 1024) {
        server.max_frame_len = v;
    }

    // ── Timing ──────────────────────────────────────────────────────
    if let Some(v) = env.u64("RELAY_AUTH_TIMEOUT_MS", 100, 3_600_000) {
        server.timing.auth_timeout_ms = v;
    }
    if let Some(v) = env.u64("RELAY_IDLE_TIMEOUT_MS", 1_000, 86_400_000) {
        server.timing.idle_timeout_ms = v;
    }

    // ── Cache / admission ───────────────────────────────────────────
    if let Some(v) = env.bool("RELAY_CACHE_ENABLED") {
        server.cache.enabled = v;
    }
    if let Some(v) = env.u64("RELAY_CACHE_TTL_MS", 1, 3_600_000) {
        server.cache.ttl_ms = v;
    }
    if let Some(v) = env.bool("RELAY_RATE_LIMIT_ENABLED") {
        server.rate_limit.enabled = v;
    }
    if let Some(v) = env.u64("RELAY_RATE_LIMIT_PERCENT", 0, 100) {
        server.rate_limit.filter_percent = u8::try_from(v).unwrap_or(100);
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.bool("RELAY_AUTH_ENABLED") {
        server.auth.enabled = v;
    }
    if let Some(v) = env.string("RELAY_TOKEN_SECRET") {
        server.auth.token_secret = v;
    }
    if let Some(v) = env.string("RELAY_REAUTH_POLICY") {
        match serde_json::from_value::<ReauthPolicy>(Value::String(v.clone())) {
            Ok(policy) => server.auth.reauth_policy = policy,
            Err(_) => tracing::warn!(key = "RELAY_REAUTH_POLICY", value = %v, "unknown reauth policy, ignoring"),
        }
    }

    // ── Client ──────────────────────────────────────────────────────
    let client = &mut settings.client;
    if let Some(v) = env.bool("RELAY_AUTO_RECONNECT") {
        client.auto_reconnect = v;
    }
    if let Some(v) = env.u64("RELAY_MAX_RECONNECT_ATTEMPTS", 0, u64::from(u32::MAX)) {
        client.max_reconnect_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("RELAY_RECONNECT_INTERVAL_MS", 10, 3_600_000) {
        client.reconnect_interval_ms = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` within `[min, max]`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `[min, max]`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.raw(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.raw(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.raw(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.raw(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::errors::SettingsError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_keeps_siblings() {
        let target = serde_json::json!({"server": {"tcpPort": 9000, "host": "127.0.0.1"}});
        let source = serde_json::json!({"server": {"tcpPort": 7000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["tcpPort"], 7000);
        assert_eq!(merged["server"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let merged = deep_merge(
            serde_json::json!({"a": {"nested": true}}),
            serde_json::json!({"a": 42}),
        );
        assert_eq!(merged["a"], 42);
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/relay.json")).unwrap();
        assert_eq!(settings.server.tcp_port, 9000);
        assert_eq!(settings.server.ws_port, 9001);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"tcpPort": 7100, "timing": {"authTimeoutMs": 500}}, "client": {"autoReconnect": true}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.server.tcp_port, 7100);
        assert_eq!(settings.server.timing.auth_timeout_ms, 500);
        assert_eq!(settings.server.timing.idle_timeout_ms, 600_000);
        assert!(settings.client.auto_reconnect);
        assert_eq!(settings.client.max_reconnect_attempts, 5);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert_matches!(load_file_layer(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"tcpPort": "high"}}"#).unwrap();
        assert_matches!(load_file_layer(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn invalid_combination_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"rateLimit": {"filterPercent": 150}}}"#).unwrap();
        let settings = load_file_layer(&path).unwrap();
        assert_matches!(settings.validate(), Err(SettingsError::InvalidValue(_)));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_ports_and_flags() {
        let mut s = RelaySettings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("RELAY_TCP_PORT", "0"),
                ("RELAY_WS_ENABLED", "off"),
                ("RELAY_RATE_LIMIT_ENABLED", "yes"),
                ("RELAY_REAUTH_POLICY", "route"),
                ("RELAY_AUTO_RECONNECT", "1"),
            ]),
        );
        assert_eq!(s.server.tcp_port, 0);
        assert!(!s.server.ws_enabled);
        assert!(s.server.rate_limit.enabled);
        assert_eq!(s.server.auth.reauth_policy, ReauthPolicy::Route);
        assert!(s.client.auto_reconnect);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = RelaySettings::default();
        apply_overrides_from(
            &mut s,
            env(&[
                ("RELAY_TCP_PORT", "99999"),
                ("RELAY_CACHE_ENABLED", "maybe"),
                ("RELAY_REAUTH_POLICY", "sometimes"),
                ("RELAY_HOST", ""),
            ]),
        );
        assert_eq!(s.server.tcp_port, 9000);
        assert!(s.server.cache.enabled);
        assert_eq!(s.server.auth.reauth_policy, ReauthPolicy::Reauthenticate);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "TRUE", "1", "yes", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_usize_range("10", 1, 5), None);
    }
}

//! Server listener, timing, cache, admission and auth settings.

use std::time::Duration;

use relay_core::ByteOrder;
use relay_core::codec::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};

/// Listener and queue settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Serve the length-prefixed byte protocol.
    pub tcp_enabled: bool,
    /// Byte protocol port (`0` picks a free port).
    pub tcp_port: u16,
    /// Serve the JSON protocol over WebSocket.
    pub ws_enabled: bool,
    /// WebSocket/HTTP port (`0` picks a free port).
    pub ws_port: u16,
    /// Upgrade path for WebSocket clients.
    pub ws_path: String,
    /// Protocol version stamped on server-originated headers.
    pub version: String,
    /// Ceiling on live connections; new connections beyond it are refused.
    pub max_connections: usize,
    /// Ceiling on a single frame (`TotalLength` or JSON text length).
    pub max_frame_len: usize,
    /// Byte order for frames and buffer bodies.
    pub byte_order: ByteOrder,
    /// Bodies longer than this are handed to the compression codec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress_threshold: Option<usize>,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
    /// Shared inbound queue depth.
    pub inbound_queue: usize,
    /// Snowflake worker id for server-generated request ids.
    pub worker_id: u16,
    /// Timers and thresholds.
    pub timing: TimingSettings,
    /// Response cache.
    pub cache: CacheSettings,
    /// Admission gate.
    pub rate_limit: RateLimitSettings,
    /// Authentication handshake.
    pub auth: AuthSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_enabled: true,
            tcp_port: 9000,
            ws_enabled: true,
            ws_port: 9001,
            ws_path: "/ws".to_string(),
            version: relay_core::header::DEFAULT_VERSION.to_string(),
            max_connections: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            byte_order: ByteOrder::Big,
            compress_threshold: None,
            outbound_queue: 1024,
            inbound_queue: 4096,
            worker_id: 1,
            timing: TimingSettings::default(),
            cache: CacheSettings::default(),
            rate_limit: RateLimitSettings::default(),
            auth: AuthSettings::default(),
        }
    }
}

/// Timers and thresholds, all in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingSettings {
    /// Time allowed between connect and a successful AUTH.
    pub auth_timeout_ms: u64,
    /// Inactivity after which a connection is closed.
    pub idle_timeout_ms: u64,
    /// Queue delay that gets logged.
    pub stale_warn_ms: u64,
    /// Queue delay after which the handler is skipped.
    pub stale_abandon_ms: u64,
    /// Handler runtime that gets logged as slow.
    pub slow_handler_ms: u64,
    /// Cadence of cache and idle sweeps.
    pub sweep_interval_ms: u64,
    /// WebSocket ping cadence.
    pub ws_ping_interval_ms: u64,
    /// Grace period for tasks to finish on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 30_000,
            idle_timeout_ms: 600_000,
            stale_warn_ms: 1_000,
            stale_abandon_ms: 5_000,
            slow_handler_ms: 1_000,
            sweep_interval_ms: 5_000,
            ws_ping_interval_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TimingSettings {
    /// Auth timer.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Slow-handler threshold.
    pub fn slow_handler(&self) -> Duration {
        Duration::from_millis(self.slow_handler_ms)
    }

    /// Sweep cadence.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// WebSocket ping cadence.
    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_millis(self.ws_ping_interval_ms.max(1))
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Response cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Master switch.
    pub enabled: bool,
    /// Entry lifetime in milliseconds.
    pub ttl_ms: u64,
    /// Entries kept per user; the oldest is evicted first.
    pub max_per_user: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 30_000,
            max_per_user: 10,
        }
    }
}

impl CacheSettings {
    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Admission gate settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Start with the limiter engaged.
    pub enabled: bool,
    /// How long the limiter stays engaged once enabled.
    pub window_ms: u64,
    /// Percentage of messages rejected while engaged (0 to 100).
    pub filter_percent: u8,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 600_000,
            filter_percent: 20,
        }
    }
}

impl RateLimitSettings {
    /// Engagement window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// What an authenticated connection's repeated AUTH does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReauthPolicy {
    /// Check the credentials again and reply with a fresh AUTH_RESULT.
    #[default]
    Reauthenticate,
    /// Treat AUTH as an ordinary protocol and queue it for dispatch.
    Route,
}

/// Authentication handshake settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Gate every connection behind AUTH.
    pub enabled: bool,
    /// HMAC secret for issued tokens.
    pub token_secret: String,
    /// Lifetime of issued tokens.
    pub token_ttl_minutes: u32,
    /// Repeated AUTH behaviour.
    pub reauth_policy: ReauthPolicy,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            token_secret: "relay-dev-secret".to_string(),
            token_ttl_minutes: 3,
            reauth_policy: ReauthPolicy::Reauthenticate,
        }
    }
}

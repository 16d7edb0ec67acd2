//! Client connection, reconnect and keepalive settings.

use std::time::Duration;

use relay_core::ByteOrder;
use relay_core::codec::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};

/// Client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Protocol version stamped on outgoing headers.
    pub version: String,
    /// Retry automatically after the link drops.
    pub auto_reconnect: bool,
    /// Attempts before auto-reconnect gives up; `0` retries forever.
    pub max_reconnect_attempts: u32,
    /// Delay between reconnect checks.
    pub reconnect_interval_ms: u64,
    /// Keepalive PING cadence once authenticated.
    pub ping_interval_ms: u64,
    /// How long `request` waits for a correlated reply.
    pub request_timeout_ms: u64,
    /// Inbound messages older than this are logged.
    pub stale_warn_ms: u64,
    /// Inbound messages older than this are dropped.
    pub stale_abandon_ms: u64,
    /// Ceiling on a single frame.
    pub max_frame_len: usize,
    /// Byte order for frames and buffer bodies.
    pub byte_order: ByteOrder,
    /// Snowflake worker id for request ids.
    pub worker_id: u16,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            version: relay_core::header::DEFAULT_VERSION.to_string(),
            auto_reconnect: false,
            max_reconnect_attempts: 5,
            reconnect_interval_ms: 5_000,
            ping_interval_ms: 30_000,
            request_timeout_ms: 10_000,
            stale_warn_ms: 1_000,
            stale_abandon_ms: 5_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            byte_order: ByteOrder::Big,
            worker_id: 2,
        }
    }
}

impl ClientSettings {
    /// Reconnect cadence.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    /// Keepalive cadence.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    /// Request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reconnect_off_by_default() {
        let c = ClientSettings::default();
        assert!(!c.auto_reconnect);
        assert_eq!(c.max_reconnect_attempts, 5);
        assert_eq!(c.reconnect_interval(), Duration::from_secs(5));
    }

    #[test]
    fn default_ping_interval() {
        assert_eq!(ClientSettings::default().ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let c = ClientSettings {
            reconnect_interval_ms: 0,
            ..ClientSettings::default()
        };
        assert_eq!(c.reconnect_interval(), Duration::from_millis(1));
    }
}

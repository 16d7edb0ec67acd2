//! Settings types.

mod client;
mod server;

pub use client::ClientSettings;
pub use server::{
    AuthSettings, CacheSettings, RateLimitSettings, ReauthPolicy, ServerSettings, TimingSettings,
};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: LogLevelSetting,
    /// Server side.
    pub server: ServerSettings,
    /// Client side.
    pub client: ClientSettings,
}

/// Log level wrapper so the default lives with the settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevelSetting(pub String);

impl Default for LogLevelSetting {
    fn default() -> Self {
        Self("info".to_string())
    }
}

impl RelaySettings {
    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
    }
}

impl ServerSettings {
    /// Reject server combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        let server = self;
        let timing = &server.timing;
        if timing.stale_warn_ms > timing.stale_abandon_ms {
            return Err(SettingsError::InvalidValue(format!(
                "staleWarnMs ({}) must not exceed staleAbandonMs ({})",
                timing.stale_warn_ms, timing.stale_abandon_ms
            )));
        }
        if server.rate_limit.filter_percent > 100 {
            return Err(SettingsError::InvalidValue(format!(
                "filterPercent {} is above 100",
                server.rate_limit.filter_percent
            )));
        }
        if server.max_frame_len < 16 {
            return Err(SettingsError::InvalidValue(format!(
                "maxFrameLen {} cannot hold a header",
                server.max_frame_len
            )));
        }
        if server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "maxConnections must be at least 1".to_string(),
            ));
        }
        if server.auth.enabled && server.auth.token_secret.is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.tokenSecret is empty".to_string(),
            ));
        }
        if !server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "wsPath {:?} must start with '/'",
                server.ws_path
            )));
        }
        Ok(())
    }
}

//! # relay-settings
//!
//! Layered configuration for relay servers and clients:
//!
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.relay/settings.json`, deep-merged over defaults
//! 3. **Environment**: `RELAY_*` overrides
//!
//! The result is validated; nonsensical combinations surface as
//! [`SettingsError::InvalidValue`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;

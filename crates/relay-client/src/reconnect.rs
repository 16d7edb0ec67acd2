//! Bounded auto-reconnect bookkeeping.
//!
//! The controller is a plain state machine; the client drives it from a
//! periodic task and performs whatever action each tick returns.

use std::time::Duration;

use relay_settings::ClientSettings;

/// What a tick asks the driver to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Nothing to do.
    Idle,
    /// Try to connect; `attempt` counts from 1.
    Retry {
        /// Attempt number since the last successful connection.
        attempt: u32,
    },
    /// Attempts exhausted; auto-reconnect is now off and the task should stop.
    Exhausted,
    /// Connected again; the attempt counter went back to zero.
    Reset,
}

/// Reconnect state: enabled flag, attempt ceiling, cadence and counter.
#[derive(Clone, Debug)]
pub struct ReconnectController {
    enabled: bool,
    max_attempts: u32,
    interval: Duration,
    attempts: u32,
}

impl ReconnectController {
    /// Controller with an explicit ceiling (`0` = unlimited).
    pub fn new(enabled: bool, max_attempts: u32, interval: Duration) -> Self {
        Self {
            enabled,
            max_attempts,
            interval,
            attempts: 0,
        }
    }

    /// Controller configured from client settings.
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            settings.auto_reconnect,
            settings.max_reconnect_attempts,
            settings.reconnect_interval(),
        )
    }

    /// Advance one period given the current link state.
    pub fn tick(&mut self, connected: bool) -> ReconnectAction {
        if !self.enabled {
            return ReconnectAction::Idle;
        }
        if connected {
            if self.attempts == 0 {
                return ReconnectAction::Idle;
            }
            self.attempts = 0;
            return ReconnectAction::Reset;
        }
        if self.max_attempts == 0 || self.attempts < self.max_attempts {
            self.attempts += 1;
            ReconnectAction::Retry {
                attempt: self.attempts,
            }
        } else {
            self.enabled = false;
            ReconnectAction::Exhausted
        }
    }

    /// Turn auto-reconnect on and clear the counter.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.attempts = 0;
    }

    /// Turn auto-reconnect off.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Whether ticks may retry.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt ceiling.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Tick cadence.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

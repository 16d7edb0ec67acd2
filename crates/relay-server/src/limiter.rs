//! Admission gate consulted before each dispatch.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use relay_core::Message;
use relay_settings::RateLimitSettings;
use tokio::time::Instant;
use tracing::info;

/// Pass/fail decision taken once per dequeued message.
pub trait AdmissionGate: Send + Sync {
    /// Whether `message` may proceed to its handler.
    fn admit(&self, message: &Message) -> bool;
}

#[derive(Debug, Default)]
struct Window {
    until: Option<Instant>,
    filter_percent: u8,
}

/// Probabilistic load shedder with a self-expiring window.
///
/// While engaged, a uniform draw in `1..=100` passes when it exceeds the
/// filter percentage. Once the window has elapsed the limiter disengages on
/// its own.
#[derive(Debug, Default)]
pub struct RateLimiter {
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Disengaged limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter engaged according to settings.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        let limiter = Self::new();
        if settings.enabled {
            limiter.enable(settings.window(), settings.filter_percent);
        }
        limiter
    }

    /// Start rejecting `filter_percent` percent of messages for `window`.
    pub fn enable(&self, window: Duration, filter_percent: u8) {
        let filter_percent = filter_percent.min(100);
        *self.window.lock() = Window {
            until: Some(Instant::now() + window),
            filter_percent,
        };
        info!(window_ms = window.as_millis(), filter_percent, "rate limiter engaged");
    }

    /// Stop rejecting.
    pub fn disable(&self) {
        self.window.lock().until = None;
    }

    /// Whether the window is open.
    pub fn is_enabled(&self) -> bool {
        let mut window = self.window.lock();
        Self::expire(&mut window)
    }

    fn expire(window: &mut Window) -> bool {
        match window.until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                window.until = None;
                info!("rate limiter window elapsed, disengaging");
                false
            }
            None => false,
        }
    }
}

impl AdmissionGate for RateLimiter {
    fn admit(&self, _message: &Message) -> bool {
        let filter = {
            let mut window = self.window.lock();
            if !Self::expire(&mut window) {
                return true;
            }
            window.filter_percent
        };
        let draw: u8 = rand::rng().random_range(1..=100);
        draw > filter
    }
}

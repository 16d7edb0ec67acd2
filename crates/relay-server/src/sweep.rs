//! Periodic maintenance: cache expiry and idle-connection reaping.

use std::sync::Arc;
use std::time::Duration;

use relay_core::body::IDLE_TIMEOUT;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::ServerContext;

/// Outcome of one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Cache entries expired.
    pub expired: usize,
    /// Connections disconnected for idleness.
    pub idle_closed: usize,
}

/// Run one pass. Idle detection is skipped when `idle_timeout` is zero.
pub fn sweep_once(server: &ServerContext, idle_timeout: Duration) -> SweepReport {
    let expired = server.cache.update();
    let mut idle_closed = 0;
    if !idle_timeout.is_zero() {
        for connection in server.registry.all() {
            if connection.is_closed() || connection.idle_for() <= idle_timeout {
                continue;
            }
            info!(
                session_id = connection.session_id,
                idle_ms = connection.idle_for().as_millis(),
                "idle timeout"
            );
            connection.disconnect(IDLE_TIMEOUT, "idle timeout");
            idle_closed += 1;
        }
    }
    if expired > 0 || idle_closed > 0 {
        debug!(expired, idle_closed, "sweep");
    }
    SweepReport { expired, idle_closed }
}

/// Sweep every `settings.timing.sweep_interval()` until cancelled.
pub async fn run_sweeper(server: Arc<ServerContext>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(server.settings.timing.sweep_interval());
    // Skip the immediate first tick
    let _ = interval.tick().await;
    let idle_timeout = server.settings.timing.idle_timeout();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let _ = sweep_once(&server, idle_timeout);
            }
        }
    }
}

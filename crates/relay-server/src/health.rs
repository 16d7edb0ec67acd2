//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connections across both transports.
    pub connections: usize,
    /// Highest connection count seen.
    pub peak_connections: usize,
    /// Responses held for replay.
    pub cached_responses: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, peak: usize, cached: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        peak_connections: peak,
        cached_responses: cached,
    }
}

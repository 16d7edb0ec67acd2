//! Prometheus recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::{Result, ServerError};

/// Install the global Prometheus recorder and return its render handle.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter, labels: transport).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections closed (counter, labels: transport).
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Connections refused at the ceiling (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "relay_connections_rejected_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Connection lifetime (histogram, labels: transport).
pub const CONNECTION_DURATION_SECONDS: &str = "relay_connection_duration_seconds";
/// Messages dispatched (counter, labels: protocol).
pub const REQUESTS_TOTAL: &str = "relay_requests_total";
/// Handler runtime (histogram, labels: protocol).
pub const REQUEST_DURATION_SECONDS: &str = "relay_request_duration_seconds";
/// Handler failures (counter, labels: protocol, error_type).
pub const HANDLER_ERRORS_TOTAL: &str = "relay_handler_errors_total";
/// Messages for unregistered keys (counter).
pub const UNROUTED_TOTAL: &str = "relay_unrouted_total";
/// Busy replies (counter, labels: reason).
pub const BUSY_TOTAL: &str = "relay_busy_total";
/// Late messages (counter, labels: outcome).
pub const STALE_TOTAL: &str = "relay_stale_total";
/// Replays served from the response cache (counter).
pub const CACHE_HITS_TOTAL: &str = "relay_cache_hits_total";
/// Cached responses held (gauge).
pub const CACHE_ENTRIES: &str = "relay_cache_entries";
/// AUTH outcomes (counter, labels: result).
pub const AUTH_TOTAL: &str = "relay_auth_total";
/// Outbound messages dropped on a full queue (counter).
pub const SEND_DROPS_TOTAL: &str = "relay_send_drops_total";
/// Framing failures that closed a connection (counter, labels: transport).
pub const FRAME_ERRORS_TOTAL: &str = "relay_frame_errors_total";

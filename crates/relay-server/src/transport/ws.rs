//! JSON envelopes over WebSocket text frames, plus the HTTP side routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::{Sink, SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{BodyFormat, JsonCodec};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Acceptor, drain_writer};
use crate::connection::Outbound;
use crate::health::{self, HealthResponse};
use crate::metrics::FRAME_ERRORS_TOTAL;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct WsState {
    /// Connection opener.
    pub acceptor: Arc<Acceptor>,
    /// Prometheus render handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Build the router: the upgrade path plus `/health` and `/metrics`.
pub fn router(state: WsState) -> Router {
    let path = state.acceptor.server().settings.ws_path.clone();
    Router::new()
        .route(&path, get(ws_upgrade))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<WsState>) -> Json<HealthResponse> {
    let server = state.acceptor.server();
    Json(health::health_check(
        server.start_time,
        server.registry.current(),
        server.registry.peak(),
        server.cache.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<WsState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET on the WebSocket path.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> Response {
    let max = state.acceptor.server().settings.max_frame_len;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| run_ws_session(socket, peer, state.acceptor))
}

/// Drive one WebSocket client from upgrade to close.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn run_ws_session(socket: WebSocket, peer: SocketAddr, acceptor: Arc<Acceptor>) {
    let Ok((connection, outbound)) = acceptor.open(peer, BodyFormat::Json, "ws") else {
        return;
    };
    let session_id = connection.session_id;
    let cancel = connection.cancel_token();
    let settings = &acceptor.server().settings;
    let codec = JsonCodec::new(settings.max_frame_len);
    let ping_every = settings.timing.ws_ping_interval();

    let (ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(write_frames(ws_tx, outbound, codec, ping_every, session_id, cancel.clone()));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = ws_rx.next() => {
                let text = match next {
                    Some(Ok(WsMessage::Text(text))) => text.to_string(),
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            counter!(FRAME_ERRORS_TOTAL, "transport" => "ws").increment(1);
                            warn!(session_id, len = data.len(), "non-UTF8 binary frame, closing");
                            break;
                        }
                    },
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        connection.touch();
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!(session_id, "client sent close frame");
                        break;
                    }
                    Some(Err(err)) => {
                        counter!(FRAME_ERRORS_TOTAL, "transport" => "ws").increment(1);
                        debug!(session_id, error = %err, "websocket read failed");
                        break;
                    }
                    None => break,
                };
                match codec.decode(&text) {
                    Ok(message) => {
                        let _ = acceptor.receive(&connection, message).await;
                    }
                    Err(err) => {
                        counter!(FRAME_ERRORS_TOTAL, "transport" => "ws").increment(1);
                        warn!(session_id, error = %err, "undecodable envelope, closing");
                        break;
                    }
                }
            }
        }
    }

    acceptor.close(&connection);
    let _ = drain_writer(session_id, writer).await;
}

/// Encode outbound frames onto `ws_tx`, with a server ping every `ping_every`.
async fn write_frames<S>(
    mut ws_tx: S,
    mut outbound: mpsc::Receiver<Outbound>,
    codec: JsonCodec,
    ping_every: Duration,
    session_id: u64,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut ping_interval = tokio::time::interval(ping_every);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv() => {
                let Some(Outbound::Frame(message)) = item else {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                };
                let text = match codec.encode(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(session_id, error = %err, "outbound frame not encodable, dropped");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

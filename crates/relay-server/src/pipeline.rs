//! Receive path: everything between a decoded message and the inbound queue.
//!
//! Order: stamp receive time, auth gate, spoof-correction, cache replay,
//! bounded enqueue. Runs on the connection's I/O task.

use std::sync::Arc;

use metrics::counter;
use relay_core::{Message, StatusBody};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::auth::{AuthGate, GateOutcome};
use crate::cache::ResponseCache;
use crate::connection::Connection;
use crate::metrics::{BUSY_TOTAL, CACHE_HITS_TOTAL};

/// A message waiting for the dispatch loop.
#[derive(Debug)]
pub struct Queued {
    /// Connection it arrived on.
    pub connection: Arc<Connection>,
    /// The message, identity fields already corrected.
    pub message: Message,
}

/// What happened to a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    /// Placed on the inbound queue.
    Queued,
    /// Answered from the response cache.
    Replayed,
    /// Answered or dropped by the auth gate.
    Consumed,
    /// Inbound queue full; busy reply sent.
    Busy,
    /// Dispatch loop is gone.
    Closed,
}

/// Shared receive path for all transports.
pub struct Ingress {
    auth: AuthGate,
    cache: Arc<ResponseCache>,
    queue: mpsc::Sender<Queued>,
}

impl Ingress {
    /// Receive path feeding `queue`.
    pub fn new(auth: AuthGate, cache: Arc<ResponseCache>, queue: mpsc::Sender<Queued>) -> Self {
        Self { auth, cache, queue }
    }

    /// Arm auth for a new connection.
    pub fn on_connect(&self, connection: &Arc<Connection>) {
        self.auth.on_connect(connection);
    }

    /// Process one decoded message.
    pub async fn receive(&self, connection: &Arc<Connection>, mut message: Message) -> Received {
        message.header.stamp_received();
        connection.touch();

        if self.auth.check(connection, &message).await == GateOutcome::Consumed {
            return Received::Consumed;
        }

        // Identity always comes from the connection, never the wire.
        message.header.session_id = connection.session_id;
        message.header.user_id = connection.user_id();
        message.header.ip = connection.ip();

        let key = message.key();
        if self.cache.is_cacheable(key) {
            if let Some(hit) = self.cache.peek(&message.header.user_id, key, message.request_id()) {
                counter!(CACHE_HITS_TOTAL).increment(1);
                debug!(
                    session_id = connection.session_id,
                    protocol = %key,
                    request_id = message.request_id(),
                    "replaying cached response"
                );
                let _ = connection.send(hit);
                return Received::Replayed;
            }
        }

        let queued = Queued {
            connection: connection.clone(),
            message,
        };
        match self.queue.try_send(queued) {
            Ok(()) => Received::Queued,
            Err(TrySendError::Full(rejected)) => {
                counter!(BUSY_TOTAL, "reason" => "queue_full").increment(1);
                warn!(
                    session_id = connection.session_id,
                    protocol = %key,
                    request_id = rejected.message.request_id(),
                    "inbound queue full"
                );
                let _ = connection.send_body(rejected.message.header.reply(), &StatusBody::busy());
                Received::Busy
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = connection.session_id, "dispatch loop stopped, dropping");
                Received::Closed
            }
        }
    }
}

//! The dispatch loop: drains the inbound queue into protocol handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use relay_core::{Message, StatusBody};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{HandlerContext, ServerContext};
use crate::limiter::AdmissionGate;
use crate::metrics::BUSY_TOTAL;
use crate::pipeline::Queued;
use crate::protocol::ProtocolRegistry;
use crate::protocol::guard::log_panic;

/// Everything the loop needs besides its queue.
pub struct Dispatcher {
    protocols: Arc<ProtocolRegistry>,
    server: Arc<ServerContext>,
    gate: Arc<dyn AdmissionGate>,
}

impl Dispatcher {
    /// Dispatcher over a frozen protocol table.
    pub fn new(protocols: Arc<ProtocolRegistry>, server: Arc<ServerContext>, gate: Arc<dyn AdmissionGate>) -> Self {
        Self {
            protocols,
            server,
            gate,
        }
    }

    /// Handle one queued message to completion.
    pub async fn process(&self, queued: Queued) {
        let Queued { connection, message } = queued;
        if connection.is_closed() {
            debug!(session_id = connection.session_id, "connection closed, skipping");
            return;
        }

        if !self.gate.admit(&message) {
            counter!(BUSY_TOTAL, "reason" => "admission").increment(1);
            debug!(
                session_id = connection.session_id,
                protocol = %message.key(),
                request_id = message.request_id(),
                "admission refused"
            );
            let _ = connection.send_body(message.header.reply(), &StatusBody::busy());
            return;
        }

        let key = message.key();
        let session_id = message.header.session_id;
        let request_id = message.request_id();
        let reply_header = message.header.reply();
        let ctx = HandlerContext::new(connection.clone(), self.server.clone());

        let outcome = AssertUnwindSafe(self.protocols.dispatch(message, ctx.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(Some(reply))) => {
                if !ctx.send(reply) {
                    warn!(session_id, protocol = %key, request_id, "reply dropped");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                error!(session_id, protocol = %key, request_id, error = %err, "handler error");
                let body = StatusBody::new(err.code(), err.to_string());
                let _ = connection.send_body(reply_header, &body);
            }
            Err(panic) => log_panic(key, session_id, request_id, panic.as_ref()),
        }
    }
}

/// Drain `rx` until cancelled or every sender is gone.
pub async fn run_dispatch_loop(dispatcher: Dispatcher, mut rx: mpsc::Receiver<Queued>, cancel: CancellationToken) {
    info!("dispatch loop started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(queued) => dispatcher.process(queued).await,
                None => break,
            },
        }
    }
    info!("dispatch loop stopped");
}

/// Replies to PING with `"pong"`.
pub(crate) async fn ping(message: Message, ctx: HandlerContext) -> crate::protocol::HandlerResult {
    ctx.reply(&message, &"pong".to_owned()).map(Some)
}

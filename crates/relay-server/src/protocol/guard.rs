//! Handler wrappers applied by [`ProtocolRegistry::scan`](super::ProtocolRegistry::scan).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use relay_core::{Message, ProtocolKey, StatusBody, now_millis};
use tracing::{error, warn};

use super::{HandlerResult, ProtocolHandler};
use crate::context::HandlerContext;
use crate::metrics::{BUSY_TOTAL, STALE_TOTAL};

/// How late a message is relative to the stale thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Staleness {
    /// Within the warn threshold.
    Fresh,
    /// Past warn; still handled.
    Late(u64),
    /// Past abandon; never handled.
    Abandoned(u64),
}

/// Classify a queue delay. Abandon is checked first.
pub fn classify(age_ms: u64, warn_ms: u64, abandon_ms: u64) -> Staleness {
    if age_ms > abandon_ms {
        Staleness::Abandoned(age_ms)
    } else if age_ms > warn_ms {
        Staleness::Late(age_ms)
    } else {
        Staleness::Fresh
    }
}

/// Skips messages that waited too long in the queue.
pub struct StaleGuard {
    inner: Arc<dyn ProtocolHandler>,
    warn_ms: u64,
    abandon_ms: u64,
}

impl StaleGuard {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn ProtocolHandler>, warn_ms: u64, abandon_ms: u64) -> Self {
        Self {
            inner,
            warn_ms,
            abandon_ms,
        }
    }
}

#[async_trait]
impl ProtocolHandler for StaleGuard {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let age = message.header.age_millis(now_millis());
        match classify(age, self.warn_ms, self.abandon_ms) {
            Staleness::Fresh => self.inner.handle(message, ctx).await,
            Staleness::Late(age_ms) => {
                counter!(STALE_TOTAL, "outcome" => "late").increment(1);
                warn!(
                    protocol = %message.key(),
                    session_id = message.header.session_id,
                    request_id = message.request_id(),
                    age_ms,
                    "message handled late"
                );
                self.inner.handle(message, ctx).await
            }
            Staleness::Abandoned(age_ms) => {
                counter!(STALE_TOTAL, "outcome" => "abandoned").increment(1);
                counter!(BUSY_TOTAL, "reason" => "stale").increment(1);
                warn!(
                    protocol = %message.key(),
                    session_id = message.header.session_id,
                    request_id = message.request_id(),
                    age_ms,
                    "message abandoned"
                );
                // Sent directly so the busy reply never enters the cache.
                let _ = ctx
                    .connection()
                    .send_body(message.header.reply(), &StatusBody::busy());
                Ok(None)
            }
        }
    }
}

/// Contains handler errors and panics.
pub struct Isolated {
    inner: Arc<dyn ProtocolHandler>,
}

impl Isolated {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn ProtocolHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ProtocolHandler for Isolated {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let key = message.key();
        let session_id = message.header.session_id;
        let request_id = message.request_id();

        match AssertUnwindSafe(self.inner.handle(message, ctx)).catch_unwind().await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                error!(protocol = %key, session_id, request_id, error = %err, "handler failed");
                Ok(None)
            }
            Err(panic) => {
                log_panic(key, session_id, request_id, panic.as_ref());
                Ok(None)
            }
        }
    }
}

/// Log a caught panic payload.
pub(crate) fn log_panic(key: ProtocolKey, session_id: u64, request_id: u64, panic: &(dyn Any + Send)) {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_owned());
    error!(protocol = %key, session_id, request_id, %reason, "handler panicked");
}

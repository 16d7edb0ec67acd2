//! Protocol registry: `(mainNo, subNo)` to handler, with explicit tables
//! instead of discovery.

pub mod guard;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use relay_core::{Message, ProtocolKey};
use relay_settings::TimingSettings;
use tracing::{debug, warn};

use crate::context::HandlerContext;
use crate::errors::HandlerError;
use crate::metrics::{
    HANDLER_ERRORS_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, UNROUTED_TOTAL,
};

pub use guard::{Isolated, StaleGuard, Staleness, classify};

/// A handler's outcome: an optional reply routed through the outbox.
pub type HandlerResult = Result<Option<Message>, HandlerError>;

/// Handles one protocol key.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handle `message`, optionally returning the reply.
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult;
}

// ── Closure adapters ────────────────────────────────────────────────

/// Handler built from `Fn(Message) -> Future`.
pub struct FnHandler<F>(F);

/// Handler built from `Fn(Message, HandlerContext) -> Future`.
pub struct ContextFnHandler<F>(F);

/// Adapt a message-only closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

/// Adapt a closure that also needs the connection and server services.
pub fn context_fn<F, Fut>(f: F) -> ContextFnHandler<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    ContextFnHandler(f)
}

#[async_trait]
impl<F, Fut> ProtocolHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: Message, _ctx: HandlerContext) -> HandlerResult {
        (self.0)(message).await
    }
}

#[async_trait]
impl<F, Fut> ProtocolHandler for ContextFnHandler<F>
where
    F: Fn(Message, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        (self.0)(message, ctx).await
    }
}

// ── Tables ──────────────────────────────────────────────────────────

/// Declarative metadata for one table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolTag {
    /// Key served.
    pub key: ProtocolKey,
    /// Responses may be replayed from the cache.
    pub cacheable: bool,
    /// Errors and panics are contained and logged.
    pub safe: bool,
    /// Human-readable description.
    pub describe: &'static str,
}

impl ProtocolTag {
    /// Tag for `key`: not cacheable, safe.
    pub const fn new(key: ProtocolKey, describe: &'static str) -> Self {
        Self {
            key,
            cacheable: false,
            safe: true,
            describe,
        }
    }

    /// Mark responses cacheable.
    #[must_use]
    pub const fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Let errors propagate to the dispatch loop.
    #[must_use]
    pub const fn unsafe_errors(mut self) -> Self {
        self.safe = false;
        self
    }
}

/// A tagged handler for [`ProtocolRegistry::scan`].
pub struct ProtocolEntry {
    /// Metadata.
    pub tag: ProtocolTag,
    /// Handler.
    pub handler: Arc<dyn ProtocolHandler>,
}

impl ProtocolEntry {
    /// Pair a tag with a handler.
    pub fn new(tag: ProtocolTag, handler: impl ProtocolHandler + 'static) -> Self {
        Self {
            tag,
            handler: Arc::new(handler),
        }
    }
}

/// Stored registration.
struct Registration {
    handler: Arc<dyn ProtocolHandler>,
    cacheable: bool,
    description: String,
}

/// Queue-delay and runtime thresholds used by dispatch and the stale guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    /// Queue delay that gets logged.
    pub stale_warn_ms: u64,
    /// Queue delay after which handlers are skipped.
    pub stale_abandon_ms: u64,
    /// Handler runtime that gets logged.
    pub slow_handler: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_timing(&TimingSettings::default())
    }
}

impl Thresholds {
    /// Thresholds from timing settings.
    pub fn from_timing(timing: &TimingSettings) -> Self {
        Self {
            stale_warn_ms: timing.stale_warn_ms,
            stale_abandon_ms: timing.stale_abandon_ms,
            slow_handler: timing.slow_handler(),
        }
    }
}

/// Maps protocol keys to handlers. Read-only once the server starts.
pub struct ProtocolRegistry {
    handlers: HashMap<ProtocolKey, Registration>,
    thresholds: Thresholds,
}

impl ProtocolRegistry {
    /// Empty registry with default thresholds.
    pub fn new() -> Self {
        Self::with_thresholds(Thresholds::default())
    }

    /// Empty registry with explicit thresholds.
    pub fn with_thresholds(thresholds: Thresholds) -> Self {
        Self {
            handlers: HashMap::new(),
            thresholds,
        }
    }

    /// Current thresholds.
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Replace thresholds; affects entries scanned afterwards.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    /// Register `handler` for `key` as is. A previous entry is replaced.
    pub fn register(&mut self, key: ProtocolKey, handler: impl ProtocolHandler + 'static, cacheable: bool) {
        self.insert(key, Arc::new(handler), cacheable, String::new());
    }

    fn insert(&mut self, key: ProtocolKey, handler: Arc<dyn ProtocolHandler>, cacheable: bool, description: String) {
        let previous = self.handlers.insert(
            key,
            Registration {
                handler,
                cacheable,
                description,
            },
        );
        if previous.is_some() {
            warn!(protocol = %key, "handler replaced");
        }
    }

    /// Register a table. Keys already present are skipped. Each handler gets
    /// the stale guard; safe ones are also isolated. Returns how many entries
    /// were added.
    pub fn scan(&mut self, table: impl IntoIterator<Item = ProtocolEntry>) -> usize {
        let mut added = 0;
        for ProtocolEntry { tag, handler } in table {
            if self.handlers.contains_key(&tag.key) {
                debug!(protocol = %tag.key, "already registered, skipping");
                continue;
            }
            let mut wrapped: Arc<dyn ProtocolHandler> = Arc::new(StaleGuard::new(
                handler,
                self.thresholds.stale_warn_ms,
                self.thresholds.stale_abandon_ms,
            ));
            if tag.safe {
                wrapped = Arc::new(Isolated::new(wrapped));
            }
            self.insert(tag.key, wrapped, tag.cacheable, tag.describe.to_owned());
            added += 1;
        }
        added
    }

    /// Whether `key` has a handler.
    pub fn is_registered(&self, key: ProtocolKey) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Whether responses on `key` may be cached.
    pub fn is_cacheable(&self, key: ProtocolKey) -> bool {
        self.handlers.get(&key).is_some_and(|r| r.cacheable)
    }

    /// Description given at scan time.
    pub fn describe(&self, key: ProtocolKey) -> Option<&str> {
        self.handlers.get(&key).map(|r| r.description.as_str())
    }

    /// Number of registered keys.
    pub fn count(&self) -> usize {
        self.handlers.len()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<ProtocolKey> {
        let mut keys: Vec<_> = self.handlers.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Cacheable keys, sorted.
    pub fn cacheable_keys(&self) -> Vec<ProtocolKey> {
        let mut keys: Vec<_> = self
            .handlers
            .iter()
            .filter(|(_, r)| r.cacheable)
            .map(|(k, _)| *k)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Run the handler for `message`. Unregistered keys are logged and dropped.
    pub async fn dispatch(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let key = message.key();
        let Some(registration) = self.handlers.get(&key) else {
            counter!(UNROUTED_TOTAL).increment(1);
            warn!(
                protocol = %key,
                session_id = message.header.session_id,
                request_id = message.request_id(),
                "no handler registered, dropping"
            );
            return Ok(None);
        };

        let protocol = key.to_string();
        counter!(REQUESTS_TOTAL, "protocol" => protocol.clone()).increment(1);
        let session_id = message.header.session_id;
        let request_id = message.request_id();

        let start = Instant::now();
        let result = registration.handler.handle(message, ctx).await;
        let elapsed = start.elapsed();
        histogram!(REQUEST_DURATION_SECONDS, "protocol" => protocol.clone()).record(elapsed.as_secs_f64());

        if elapsed > self.thresholds.slow_handler {
            warn!(
                protocol = %key,
                session_id,
                request_id,
                elapsed_ms = elapsed.as_millis(),
                "slow handler"
            );
        }
        if let Err(err) = &result {
            counter!(HANDLER_ERRORS_TOTAL, "protocol" => protocol, "error_type" => err.kind()).increment(1);
        }
        result
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

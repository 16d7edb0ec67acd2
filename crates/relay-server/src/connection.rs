//! Per-connection state shared between the transport task, the dispatch loop
//! and handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use relay_core::{BodyFormat, Header, Message, ProtocolKey, StatusBody, now_millis};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::peer_ip;
use crate::metrics::SEND_DROPS_TOTAL;

/// Identifier the transport layer uses for its socket.
pub type TransportId = u64;

/// Item on a connection's outbound channel.
#[derive(Debug)]
pub enum Outbound {
    /// Encode and write a message.
    Frame(Message),
    /// Flush what came before, then close the socket.
    Close,
}

/// What the transport hands the registry when a socket opens.
#[derive(Debug)]
pub struct TransportHandle {
    /// Transport-local socket id.
    pub id: TransportId,
    /// Remote address.
    pub peer: SocketAddr,
    /// Body encoding used on this socket.
    pub format: BodyFormat,
    /// Transport label for logs and metrics (`tcp`, `ws`).
    pub transport: &'static str,
    /// Writer side of the outbound channel.
    pub tx: mpsc::Sender<Outbound>,
}

/// Authentication state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    /// Only AUTH is accepted.
    Unauthenticated,
    /// Credentials verified.
    Authenticated,
    /// Disconnect requested; further input is ignored.
    Closed,
}

#[derive(Debug, Default)]
struct Identity {
    user_id: String,
    token: String,
}

/// A live client connection.
#[derive(Debug)]
pub struct Connection {
    /// Transport-local socket id.
    pub transport_id: TransportId,
    /// Server-assigned session id, never 0.
    pub session_id: u64,
    /// Remote address.
    pub peer: SocketAddr,
    /// Protocol version stamped on server-originated headers.
    pub version: String,
    /// Body encoding for this connection.
    pub format: BodyFormat,
    /// Transport label (`tcp`, `ws`).
    pub transport: &'static str,
    /// Epoch millis at connect.
    pub connect_time: i64,
    connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    state: Mutex<AuthState>,
    identity: Mutex<Identity>,
    last_activity: Mutex<Instant>,
    auth_timer: Mutex<Option<AbortHandle>>,
    cancel: CancellationToken,
    /// Messages dropped because the outbound channel was full or closed.
    pub dropped_messages: AtomicU64,
}

impl Connection {
    /// Build connection state for a freshly accepted socket.
    pub fn new(handle: TransportHandle, session_id: u64, version: String) -> Self {
        let now = Instant::now();
        Self {
            transport_id: handle.id,
            session_id,
            peer: handle.peer,
            version,
            format: handle.format,
            transport: handle.transport,
            connect_time: now_millis(),
            connected_at: now,
            tx: handle.tx,
            state: Mutex::new(AuthState::Unauthenticated),
            identity: Mutex::new(Identity::default()),
            last_activity: Mutex::new(now),
            auth_timer: Mutex::new(None),
            cancel: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Queue a message without waiting.
    ///
    /// Returns `false` and counts a drop when the channel is full or closed.
    pub fn send(&self, message: Message) -> bool {
        if self.tx.try_send(Outbound::Frame(message)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            counter!(SEND_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Encode `body` in this connection's format and queue it.
    pub fn send_body<B: relay_core::WireBody>(&self, header: Header, body: &B) -> bool {
        match Message::with_body(self.stamp(header), body, self.format) {
            Ok(message) => self.send(message),
            Err(error) => {
                debug!(session_id = self.session_id, %error, "failed to encode outbound body");
                false
            }
        }
    }

    /// Header for a server-originated message on `key`.
    pub fn header(&self, key: ProtocolKey, request_id: u64) -> Header {
        self.stamp(Header::new(key, request_id))
    }

    fn stamp(&self, mut header: Header) -> Header {
        header.session_id = self.session_id;
        header.version.clone_from(&self.version);
        header
    }

    /// Total drops for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Close after flushing anything already queued. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == AuthState::Closed {
                return;
            }
            *state = AuthState::Closed;
        }
        self.cancel_auth_timer();
        if self.tx.try_send(Outbound::Close).is_err() {
            // Writer is gone or wedged; stop the reader directly.
            self.cancel.cancel();
        }
    }

    /// Send a DISCONNECT notice, then close.
    pub fn disconnect(&self, code: i32, reason: &str) {
        if !self.is_closed() {
            let header = self.header(ProtocolKey::DISCONNECT, 0);
            let _ = self.send_body(header, &StatusBody::new(code, reason));
        }
        self.close();
    }

    /// Token cancelled once the socket must stop reading.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        *self.state.lock() == AuthState::Closed
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    // ── Authentication ──────────────────────────────────────────────

    /// Current auth state.
    pub fn auth_state(&self) -> AuthState {
        *self.state.lock()
    }

    /// Whether AUTH succeeded and the connection is still open.
    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    /// Record a successful AUTH and stop the auth timer.
    ///
    /// Returns `false` when the connection closed in the meantime.
    pub fn mark_authenticated(&self, user_id: &str, token: &str) -> bool {
        {
            let mut state = self.state.lock();
            if *state == AuthState::Closed {
                return false;
            }
            *state = AuthState::Authenticated;
        }
        self.cancel_auth_timer();
        let mut identity = self.identity.lock();
        user_id.clone_into(&mut identity.user_id);
        token.clone_into(&mut identity.token);
        true
    }

    /// Authenticated user id, empty before AUTH.
    pub fn user_id(&self) -> String {
        self.identity.lock().user_id.clone()
    }

    /// Token issued at AUTH, empty before.
    pub fn token(&self) -> String {
        self.identity.lock().token.clone()
    }

    /// Remote IP without the port.
    pub fn ip(&self) -> String {
        peer_ip(&self.peer)
    }

    /// Keep the abort handle of the pending auth timer.
    pub fn set_auth_timer(&self, timer: AbortHandle) {
        if let Some(previous) = self.auth_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Abort the auth timer if one is pending.
    pub fn cancel_auth_timer(&self) {
        if let Some(timer) = self.auth_timer.lock().take() {
            timer.abort();
        }
    }

    /// Whether an auth timer is still pending.
    pub fn has_auth_timer(&self) -> bool {
        self.auth_timer.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    // ── Activity ────────────────────────────────────────────────────

    /// Push the idle deadline forward.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound message or pong.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

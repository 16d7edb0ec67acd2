//! The reconnecting client.
//!
//! `RelayClient` is a cheap handle over shared state. One link is live at a
//! time; a pump task routes inbound messages to pending requests, the session
//! watch, or registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use relay_core::body::OK;
use relay_core::{
    AuthRequest, AuthResult, BodyFormat, Header, Message, ProtocolKey, RequestIdGenerator,
    SessionNotice, StatusBody, WireBody, now_millis,
};
use relay_settings::ClientSettings;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::errors::{ClientError, Result};
use crate::reconnect::{ReconnectAction, ReconnectController};

// ── Metric names ────────────────────────────────────────────────────────────

/// Links opened.
pub const CLIENT_CONNECTS_TOTAL: &str = "relay_client_connects_total";
/// Reconnect attempts made by the auto-reconnect task.
pub const CLIENT_RECONNECT_ATTEMPTS_TOTAL: &str = "relay_client_reconnect_attempts_total";
/// Inbound messages dropped as too old.
pub const CLIENT_STALE_TOTAL: &str = "relay_client_stale_total";

/// Handler for server-pushed messages.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Link lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No link.
    Disconnected,
    /// Dialing.
    Connecting,
    /// Link up.
    Connected,
}

struct ActiveLink {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

#[derive(Default)]
struct Identity {
    user_id: String,
    token: String,
}

struct Inner {
    settings: ClientSettings,
    connector: Arc<dyn Connector>,
    format: BodyFormat,
    ids: RequestIdGenerator,
    state: Mutex<LinkState>,
    link: Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
    session: watch::Sender<u64>,
    identity: Mutex<Identity>,
    credentials: Mutex<Option<AuthRequest>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    handlers: RwLock<HashMap<ProtocolKey, MessageHandler>>,
    reconnect: Mutex<ReconnectController>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    rtt_ms: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.closed.cancel();
        }
        if let Some(task) = self.keepalive.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.reconnect_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Client handle. Clones share one link.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// Client dialing through `connector`. Nothing connects until [`connect`](Self::connect).
    pub fn new(settings: ClientSettings, connector: Arc<dyn Connector>) -> Self {
        let (session, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                format: connector.format(),
                ids: RequestIdGenerator::new(settings.worker_id),
                reconnect: Mutex::new(ReconnectController::from_settings(&settings)),
                settings,
                connector,
                state: Mutex::new(LinkState::Disconnected),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                session,
                identity: Mutex::new(Identity::default()),
                credentials: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                keepalive: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                rtt_ms: AtomicU64::new(u64::MAX),
            }),
        }
    }

    // ── Link lifecycle ──────────────────────────────────────────────────────

    /// Open a fresh link and wait for the server's session id.
    ///
    /// An existing link is torn down first. With auto-reconnect enabled the
    /// supervisor starts here, even when this first attempt fails.
    pub async fn connect(&self) -> Result<u64> {
        self.ensure_reconnect_task();
        self.open_link().await
    }

    async fn open_link(&self) -> Result<u64> {
        self.teardown("reconnecting");
        *self.inner.state.lock() = LinkState::Connecting;
        debug!(target_addr = %self.inner.connector.describe(), "connecting");

        let link = match self.inner.connector.connect().await {
            Ok(link) => link,
            Err(err) => {
                *self.inner.state.lock() = LinkState::Disconnected;
                return Err(err);
            }
        };
        counter!(CLIENT_CONNECTS_TOTAL).increment(1);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.inner.session.send_replace(0);
        let mut session = self.inner.session.subscribe();
        *self.inner.link.lock() = Some(ActiveLink {
            generation,
            outbound: link.outbound,
            closed: link.closed.clone(),
        });
        *self.inner.state.lock() = LinkState::Connected;

        let (events_tx, events_rx) = mpsc::channel(256);
        let _ = tokio::spawn(pump(Arc::downgrade(&self.inner), link.inbound, events_tx, generation));
        let _ = tokio::spawn(deliver(Arc::downgrade(&self.inner), events_rx));

        let wait = session.wait_for(|id| *id != 0);
        match tokio::time::timeout(self.inner.settings.request_timeout(), wait).await {
            Ok(Ok(id)) => {
                let session_id = *id;
                info!(session_id, target_addr = %self.inner.connector.describe(), "connected");
                Ok(session_id)
            }
            Ok(Err(_)) | Err(_) => {
                self.teardown("no session notice");
                Err(ClientError::NoSession)
            }
        }
    }

    /// Close the link and turn auto-reconnect off.
    pub fn disconnect(&self) {
        self.inner.reconnect.lock().disable();
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        self.teardown("client disconnect");
    }

    fn teardown(&self, reason: &str) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.closed.cancel();
            info!(reason, "link closed");
        }
        *self.inner.state.lock() = LinkState::Disconnected;
        let _ = self.inner.session.send_replace(0);
        self.stop_keepalive();
        // Dropping the senders fails every pending request with `Closed`.
        self.inner.pending.lock().clear();
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    /// Whether a link is up.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Session id announced by the server, if any.
    pub fn session_id(&self) -> Option<u64> {
        let id = *self.inner.session.borrow();
        (id != 0).then_some(id)
    }

    /// Body encoding on the current connector.
    pub fn format(&self) -> BodyFormat {
        self.inner.format
    }

    // ── Auth ────────────────────────────────────────────────────────────────

    /// Send AUTH and remember the identity on success.
    ///
    /// Credentials are kept so auto-reconnect can re-authenticate.
    pub async fn authenticate(&self, user_id: &str, password: &str) -> Result<AuthResult> {
        let request = AuthRequest {
            user_id: user_id.to_owned(),
            password: password.to_owned(),
        };
        let reply = self.request(ProtocolKey::AUTH, &request).await?;
        let result: AuthResult = reply.body(self.inner.format)?;
        if result.code != OK {
            warn!(user_id, code = result.code, reason = %result.message, "authentication refused");
            return Err(ClientError::AuthFailed {
                code: result.code,
                message: result.message,
            });
        }

        {
            let mut identity = self.inner.identity.lock();
            identity.user_id = user_id.to_owned();
            identity.token = result.token.clone().unwrap_or_default();
        }
        *self.inner.credentials.lock() = Some(request);
        info!(user_id, session_id = ?result.session_id, "authenticated");
        self.start_keepalive();
        Ok(result)
    }

    /// Authenticated user, if any.
    pub fn user_id(&self) -> Option<String> {
        let identity = self.inner.identity.lock();
        (!identity.user_id.is_empty()).then(|| identity.user_id.clone())
    }

    // ── Requests ────────────────────────────────────────────────────────────

    /// Send `body` on `key` and wait for the reply with the same request id.
    pub async fn request<B: WireBody>(&self, key: ProtocolKey, body: &B) -> Result<Message> {
        let message = Message::with_body(self.header(key), body, self.inner.format)?;
        self.exchange(message).await
    }

    /// Send `body` on `key` without waiting. Returns the request id.
    pub async fn send<B: WireBody>(&self, key: ProtocolKey, body: &B) -> Result<u64> {
        let message = Message::with_body(self.header(key), body, self.inner.format)?;
        let request_id = message.request_id();
        self.transmit(message).await?;
        Ok(request_id)
    }

    /// Invoke `handler` for every pushed message on `key`.
    pub fn on<F>(&self, key: ProtocolKey, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let _ = self.inner.handlers.write().insert(key, Arc::new(handler));
    }

    /// Round-trip a PING and record the RTT.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let _ = self.exchange(Message::empty(self.header(ProtocolKey::PING))).await?;
        let rtt = started.elapsed();
        self.inner
            .rtt_ms
            .store(u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX - 1), Ordering::Relaxed);
        Ok(rtt)
    }

    /// Last measured PING round trip.
    pub fn rtt(&self) -> Option<Duration> {
        match self.inner.rtt_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn header(&self, key: ProtocolKey) -> Header {
        let mut header = Header::new(key, self.inner.ids.next_id());
        header.version.clone_from(&self.inner.settings.version);
        header.session_id = *self.inner.session.borrow();
        let identity = self.inner.identity.lock();
        header.user_id.clone_from(&identity.user_id);
        header.token.clone_from(&identity.token);
        header
    }

    async fn exchange(&self, message: Message) -> Result<Message> {
        let key = message.key();
        let request_id = message.request_id();
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.pending.lock().insert(request_id, tx);

        if let Err(err) = self.transmit(message).await {
            let _ = self.inner.pending.lock().remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.settings.request_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                let _ = self.inner.pending.lock().remove(&request_id);
                debug!(protocol = %key, request_id, "request timed out");
                Err(ClientError::Timeout { key, request_id })
            }
        }
    }

    async fn transmit(&self, message: Message) -> Result<()> {
        let outbound = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(ClientError::NotConnected)?;
        outbound.send(message).await.map_err(|_| ClientError::NotConnected)
    }

    // ── Keepalive ───────────────────────────────────────────────────────────

    fn start_keepalive(&self) {
        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.settings.ping_interval();
        let task = tokio::spawn(keepalive(weak, every));
        if let Some(old) = self.inner.keepalive.lock().replace(task) {
            old.abort();
        }
    }

    fn stop_keepalive(&self) {
        if let Some(task) = self.inner.keepalive.lock().take() {
            task.abort();
        }
    }

    // ── Auto-reconnect ──────────────────────────────────────────────────────

    /// Turn auto-reconnect on, resetting the attempt counter.
    pub fn enable_auto_reconnect(&self) {
        self.inner.reconnect.lock().enable();
        self.ensure_reconnect_task();
    }

    /// Whether auto-reconnect is still armed.
    pub fn auto_reconnect_enabled(&self) -> bool {
        self.inner.reconnect.lock().is_enabled()
    }

    /// Attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.lock().attempts()
    }

    fn ensure_reconnect_task(&self) {
        let (enabled, interval) = {
            let controller = self.inner.reconnect.lock();
            (controller.is_enabled(), controller.interval())
        };
        if !enabled {
            return;
        }
        let mut slot = self.inner.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(supervise(Arc::downgrade(&self.inner), interval)));
    }

    async fn reconnect_once(&self) -> Result<u64> {
        let session_id = self.open_link().await?;
        let credentials = self.inner.credentials.lock().clone();
        if let Some(credentials) = credentials {
            let _ = self
                .authenticate(&credentials.user_id, &credentials.password)
                .await?;
        }
        Ok(session_id)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("target", &self.inner.connector.describe())
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

// ── Background tasks ────────────────────────────────────────────────────────

/// Route inbound messages until the link ends.
async fn pump(
    weak: Weak<Inner>,
    mut inbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<Message>,
    generation: u64,
) {
    while let Some(mut message) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        message.header.stamp_received();
        let key = message.key();

        if key == ProtocolKey::NOTIFY_SESSION_ID {
            match message.body::<SessionNotice>(inner.format) {
                Ok(notice) => {
                    let _ = inner.session.send_replace(notice.session_id);
                }
                Err(err) => warn!(error = %err, "bad session notice"),
            }
            continue;
        }

        if key == ProtocolKey::DISCONNECT {
            let reason = message
                .body::<StatusBody>(inner.format)
                .map(|body| body.message)
                .unwrap_or_default();
            info!(%reason, "server requested disconnect");
            continue;
        }

        let waiter = inner.pending.lock().remove(&message.request_id());
        if let Some(waiter) = waiter {
            let _ = waiter.send(message);
            continue;
        }

        if events.try_send(message).is_err() {
            // Overloaded or shutting down: drop silently.
            debug!(protocol = %key, "event queue full, dropping");
        }
    }

    let Some(inner) = weak.upgrade() else { return };
    let current = {
        let mut link = inner.link.lock();
        match link.as_ref() {
            Some(active) if active.generation == generation => link.take(),
            _ => None,
        }
    };
    if let Some(active) = current {
        active.closed.cancel();
        *inner.state.lock() = LinkState::Disconnected;
        let _ = inner.session.send_replace(0);
        if let Some(task) = inner.keepalive.lock().take() {
            task.abort();
        }
        inner.pending.lock().clear();
        info!(target_addr = %inner.connector.describe(), "link lost");
    }
}

/// Hand pushed messages to registered handlers, dropping stale ones.
async fn deliver(weak: Weak<Inner>, mut events: mpsc::Receiver<Message>) {
    while let Some(message) = events.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        let key = message.key();
        let age_ms = message.header.age_millis(now_millis());
        if age_ms > inner.settings.stale_abandon_ms {
            counter!(CLIENT_STALE_TOTAL).increment(1);
            debug!(protocol = %key, age_ms, "dropping stale message");
            continue;
        }
        if age_ms > inner.settings.stale_warn_ms {
            warn!(protocol = %key, age_ms, "handling late message");
        }

        let handler = inner.handlers.read().get(&key).cloned();
        match handler {
            Some(handler) => handler(message),
            None => debug!(protocol = %key, request_id = message.request_id(), "no handler"),
        }
    }
}

async fn keepalive(inner: Weak<Inner>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let _ = interval.tick().await;
    loop {
        let _ = interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        let client = RelayClient { inner };
        match client.ping().await {
            Ok(rtt) => debug!(rtt_ms = rtt.as_millis(), "keepalive"),
            Err(ClientError::NotConnected) => break,
            Err(err) => warn!(error = %err, "keepalive failed"),
        }
    }
}

async fn supervise(inner: Weak<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else { break };
        let client = RelayClient { inner };
        let action = {
            let connected = client.is_connected();
            client.inner.reconnect.lock().tick(connected)
        };
        match action {
            ReconnectAction::Idle => {}
            ReconnectAction::Reset => debug!("reconnect counter reset"),
            ReconnectAction::Retry { attempt } => {
                counter!(CLIENT_RECONNECT_ATTEMPTS_TOTAL).increment(1);
                info!(attempt, "reconnecting");
                match client.reconnect_once().await {
                    Ok(session_id) => info!(attempt, session_id, "reconnected"),
                    Err(err) => warn!(attempt, error = %err, "reconnect failed"),
                }
            }
            ReconnectAction::Exhausted => {
                warn!(
                    attempts = client.reconnect_attempts(),
                    "reconnect attempts exhausted, giving up"
                );
                break;
            }
        }
    }
}

//! `RelayServer`: wires settings, protocol tables and services into running
//! TCP and WebSocket listeners.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{Compression, FrameCodec, ProtocolKey};
use relay_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::{AuthGate, CredentialVerifier, JwtTokenService, StaticCredentials, TokenService};
use crate::context::ServerContext;
use crate::dispatch::{Dispatcher, ping, run_dispatch_loop};
use crate::errors::{Result, ServerError};
use crate::limiter::{AdmissionGate, RateLimiter};
use crate::pipeline::Ingress;
use crate::protocol::{ProtocolEntry, ProtocolRegistry, ProtocolTag, Thresholds, context_fn};
use crate::registry::{ConnectionHooks, ConnectionRegistry};
use crate::shutdown::Drain;
use crate::sweep::run_sweeper;
use crate::transport::Acceptor;
use crate::transport::tcp::serve_tcp;
use crate::transport::ws::{WsState, router};

/// Protocols every server answers.
fn builtin_protocols() -> Vec<ProtocolEntry> {
    vec![ProtocolEntry::new(
        ProtocolTag::new(ProtocolKey::PING, "keepalive ping"),
        context_fn(ping),
    )]
}

/// Server builder. Protocol tables are frozen at [`start`](Self::start).
pub struct RelayServer {
    settings: ServerSettings,
    protocols: ProtocolRegistry,
    verifier: Arc<dyn CredentialVerifier>,
    tokens: Option<Arc<dyn TokenService>>,
    gate: Option<Arc<dyn AdmissionGate>>,
    hooks: Vec<Arc<dyn ConnectionHooks>>,
    metrics: Option<PrometheusHandle>,
    compression: Option<Arc<dyn Compression>>,
}

impl RelayServer {
    /// Builder over `settings`. AUTH is refused until a verifier is set.
    pub fn new(settings: ServerSettings) -> Self {
        let protocols = ProtocolRegistry::with_thresholds(Thresholds::from_timing(&settings.timing));
        Self {
            settings,
            protocols,
            verifier: Arc::new(StaticCredentials::new()),
            tokens: None,
            gate: None,
            hooks: Vec::new(),
            metrics: None,
            compression: None,
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Direct access to the protocol table.
    pub fn protocols_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.protocols
    }

    /// Register a declarative table.
    #[must_use]
    pub fn scan(mut self, table: impl IntoIterator<Item = ProtocolEntry>) -> Self {
        let added = self.protocols.scan(table);
        info!(added, total = self.protocols.count(), "protocol table scanned");
        self
    }

    /// Credential check for AUTH.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Token issuer. Defaults to HS256 JWTs keyed by `auth.token_secret`.
    #[must_use]
    pub fn with_token_service(mut self, tokens: Arc<dyn TokenService>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Admission gate consulted before dispatch. Defaults to the rate limiter.
    #[must_use]
    pub fn with_admission_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Connection lifecycle hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ConnectionHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Compress TCP bodies above `compress_threshold` with `compression`.
    #[must_use]
    pub fn with_compression(mut self, compression: Arc<dyn Compression>) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Bind listeners and spawn the dispatch loop and sweeper.
    pub async fn start(mut self) -> Result<RunningServer> {
        self.settings.validate()?;

        let _ = self.protocols.scan(builtin_protocols());

        let tokens: Arc<dyn TokenService> = match self.tokens.take() {
            Some(tokens) => tokens,
            None => Arc::new(JwtTokenService::new(self.settings.auth.token_secret.as_bytes())),
        };
        let context = Arc::new(ServerContext::new(self.settings.clone(), tokens.clone()));
        for hook in self.hooks.drain(..) {
            context.registry.add_hook(hook);
        }
        context.cache.include(self.protocols.cacheable_keys());

        let gate: Arc<dyn AdmissionGate> = match self.gate.take() {
            Some(gate) => gate,
            None => context.limiter.clone(),
        };

        let drain = Drain::new();
        let token = drain.token();
        let mut handles = Vec::new();

        let (queue_tx, queue_rx) = mpsc::channel(self.settings.inbound_queue.max(1));
        let auth = AuthGate::new(
            &self.settings.auth,
            self.settings.timing.auth_timeout(),
            tokens,
            self.verifier.clone(),
        );
        let acceptor = Arc::new(Acceptor::new(
            context.clone(),
            Ingress::new(auth, context.cache.clone(), queue_tx),
        ));

        info!(
            protocols = self.protocols.count(),
            cacheable = context.cache.is_enabled(),
            auth = self.settings.auth.enabled,
            "starting relay server"
        );
        let dispatcher = Dispatcher::new(Arc::new(self.protocols), context.clone(), gate);
        handles.push(tokio::spawn(run_dispatch_loop(dispatcher, queue_rx, token.clone())));
        handles.push(tokio::spawn(run_sweeper(context.clone(), token.clone())));

        let mut tcp_addr = None;
        if self.settings.tcp_enabled {
            let listener = bind(&self.settings.host, self.settings.tcp_port).await?;
            tcp_addr = Some(listener.local_addr()?);
            let mut codec = FrameCodec::with_limits(self.settings.max_frame_len, self.settings.byte_order);
            if let (Some(compression), Some(threshold)) = (self.compression, self.settings.compress_threshold) {
                codec = codec.with_compression(compression, threshold);
            }
            handles.push(tokio::spawn(serve_tcp(listener, acceptor.clone(), codec, token.clone())));
        }

        let mut ws_addr = None;
        if self.settings.ws_enabled {
            let listener = bind(&self.settings.host, self.settings.ws_port).await?;
            let addr = listener.local_addr()?;
            ws_addr = Some(addr);
            let app = router(WsState {
                acceptor,
                metrics: self.metrics,
            });
            let ws_token = token.clone();
            handles.push(tokio::spawn(async move {
                info!(%addr, "websocket listener started");
                let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move { ws_token.cancelled().await })
                    .await;
                if let Err(err) = served {
                    tracing::error!(error = %err, "websocket listener failed");
                }
            }));
        }

        Ok(RunningServer {
            tcp_addr,
            ws_addr,
            context,
            drain,
            handles,
        })
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Handle to a started server.
pub struct RunningServer {
    /// Bound TCP address, if enabled.
    pub tcp_addr: Option<SocketAddr>,
    /// Bound WebSocket address, if enabled.
    pub ws_addr: Option<SocketAddr>,
    context: Arc<ServerContext>,
    drain: Drain,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningServer")
            .field("tcp_addr", &self.tcp_addr)
            .field("ws_addr", &self.ws_addr)
            .field("connections", &self.context.registry.current())
            .field("tasks", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl RunningServer {
    /// Server services.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.context.registry
    }

    /// The default admission gate.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.context.limiter
    }

    /// WebSocket URL for the configured path.
    pub fn ws_url(&self) -> Option<String> {
        self.ws_addr
            .map(|addr| format!("ws://{addr}{}", self.context.settings.ws_path))
    }

    /// Close connections, stop every task and wait the grace period.
    pub async fn shutdown(self) {
        let grace = self.context.settings.timing.shutdown_grace().max(Duration::from_millis(1));
        let report = self.drain.run(&self.context.registry, self.handles, grace).await;
        info!(sessions = report.closed_sessions, timed_out = report.timed_out, "relay server stopped");
    }
}

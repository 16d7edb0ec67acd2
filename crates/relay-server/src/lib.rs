//! # relay-server
//!
//! Server side of the relay engine.
//!
//! - Connection registry: session ids, connection ceiling, lifecycle hooks
//! - Receive pipeline: auth gate, spoof-correction, cache replay, bounded queue
//! - Single dispatch loop over an explicit protocol table
//! - TCP (length-prefixed frames) and WebSocket (JSON envelopes) listeners
//! - `/health` and `/metrics` over HTTP, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod cache;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod sweep;
pub mod transport;

pub use auth::{CredentialVerifier, JwtTokenService, StaticCredentials, TokenClaims, TokenService};
pub use connection::{AuthState, Connection};
pub use context::{HandlerContext, ServerContext};
pub use errors::{AuthError, HandlerError, Result, ServerError};
pub use limiter::{AdmissionGate, RateLimiter};
pub use protocol::{
    HandlerResult, ProtocolEntry, ProtocolHandler, ProtocolRegistry, ProtocolTag, context_fn, handler_fn,
};
pub use registry::{ConnectionHooks, ConnectionRegistry};
pub use server::{RelayServer, RunningServer};

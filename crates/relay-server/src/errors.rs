//! Server, handler and auth error types.

use std::net::SocketAddr;

use relay_core::CoreError;
use relay_core::body::{BAD_REQUEST, INTERNAL_ERROR, NOT_FOUND, UNAUTHORIZED};
use relay_settings::SettingsError;
use thiserror::Error;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Codec or body failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Settings failed validation.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The live connection ceiling is reached.
    #[error("connection limit {limit} reached")]
    ConnectionLimit {
        /// Configured ceiling.
        limit: usize,
    },

    /// The metrics recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Failure returned by a protocol handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request body could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The addressed entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller may not perform this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),

    /// Body decode or encode failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl HandlerError {
    /// Status code carried in the error reply.
    pub fn code(&self) -> i32 {
        match self {
            Self::BadRequest(_) => BAD_REQUEST,
            Self::NotFound(_) => NOT_FOUND,
            Self::Unauthorized(_) => UNAUTHORIZED,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::Core(CoreError::Io(_)) => INTERNAL_ERROR,
            Self::Core(_) => BAD_REQUEST,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) | Self::Core(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal",
        }
    }
}

/// Credential and token failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials were checked and refused.
    #[error("{0}")]
    InvalidCredentials(String),

    /// No token on a message that needs one.
    #[error("missing token")]
    MissingToken,

    /// Token signature, expiry or format is wrong.
    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Token subject does not match the claimed identity.
    #[error("token subject {subject:?} does not match user {user:?}")]
    SubjectMismatch {
        /// Subject inside the token.
        subject: String,
        /// Identity it was compared against.
        user: String,
    },

    /// The verifier itself failed.
    #[error("credential check failed: {0}")]
    Verifier(String),
}

impl AuthError {
    /// Status code reported in AUTH_RESULT.
    pub fn code(&self) -> i32 {
        match self {
            Self::Verifier(_) => INTERNAL_ERROR,
            _ => UNAUTHORIZED,
        }
    }
}

/// Peer address formatted for the `ip` header field.
pub(crate) fn peer_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

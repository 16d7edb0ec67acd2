//! Chat service errors.

use thiserror::Error;

/// Errors from chat service setup.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A `--seed-user` value was not `name:password`.
    #[error("invalid seed user {0:?}, expected name:password")]
    InvalidSeed(String),
}

/// Result type for chat operations.
pub type Result<T> = std::result::Result<T, ChatError>;

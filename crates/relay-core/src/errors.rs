//! Codec and buffer error types.

use thiserror::Error;

/// Errors raised while framing, parsing or reading message bodies.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying socket or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header or JSON body failed to (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Declared frame length exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge {
        /// Length announced by the prefix.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Frame structure is inconsistent (bad inner lengths, truncated fields).
    #[error("malformed frame: {message}")]
    Malformed {
        /// What was wrong.
        message: String,
    },

    /// A read asked for more bytes than the buffer holds.
    #[error("read of {needed} bytes past end of buffer ({remaining} remaining)")]
    OutOfBounds {
        /// Bytes requested.
        needed: usize,
        /// Bytes left after the cursor.
        remaining: usize,
    },

    /// Bytes were read successfully but do not form a valid value.
    #[error("invalid value: {message}")]
    InvalidValue {
        /// Description of the bad value.
        message: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::Malformed`].
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Shorthand for [`CoreError::InvalidValue`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Whether this error means stream alignment is lost and the link must close.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::FrameTooLarge { .. } | Self::Malformed { .. } | Self::Json(_)
        )
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

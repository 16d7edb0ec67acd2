//! JSON envelope used on WebSocket text frames.
//!
//! `{"header": {...}, "buffer": "<json payload>"}`. The WebSocket layer does
//! the framing, so only the size ceiling is enforced here.

use serde::{Deserialize, Serialize};

use super::frame::DEFAULT_MAX_FRAME_LEN;
use crate::errors::{CoreError, Result};
use crate::header::Header;
use crate::message::Message;

#[derive(Serialize, Deserialize)]
struct Envelope {
    header: Header,
    #[serde(default)]
    buffer: String,
}

/// Encoder/decoder for JSON text frames.
#[derive(Clone, Copy, Debug)]
pub struct JsonCodec {
    max_frame_len: usize,
}

impl JsonCodec {
    /// Codec with the given ceiling on text length.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Serialize a message; the body must be UTF-8 JSON text.
    pub fn encode(&self, message: &Message) -> Result<String> {
        let buffer = std::str::from_utf8(&message.body)
            .map_err(|e| CoreError::invalid(format!("JSON body is not UTF-8: {e}")))?;
        let text = serde_json::to_string(&Envelope {
            header: message.header.clone(),
            buffer: buffer.to_owned(),
        })?;
        if text.len() > self.max_frame_len {
            return Err(CoreError::FrameTooLarge {
                len: text.len(),
                max: self.max_frame_len,
            });
        }
        Ok(text)
    }

    /// Parse one text frame.
    pub fn decode(&self, text: &str) -> Result<Message> {
        if text.len() > self.max_frame_len {
            return Err(CoreError::FrameTooLarge {
                len: text.len(),
                max: self.max_frame_len,
            });
        }
        let envelope: Envelope = serde_json::from_str(text)?;
        Ok(Message::new(envelope.header, envelope.buffer.into_bytes()))
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

//! # relay-core
//!
//! Shared vocabulary for the relay engine:
//!
//! - **Protocol keys**: `(mainNo, subNo)` pairs and the reserved system keys
//! - **Header / Message**: routing metadata plus an opaque body
//! - **Structured buffer**: typed cursor reads/writes, self-describing records
//! - **Wire codecs**: length-prefixed frames (TCP) and JSON envelopes (WebSocket)
//! - **Bodies**: status, AUTH and session bodies in buffer and JSON form
//! - **Request ids**: snowflake generator
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod body;
pub mod buffer;
pub mod codec;
pub mod errors;
pub mod header;
pub mod ids;
pub mod logging;
pub mod message;
pub mod protocol;

pub use body::{AuthRequest, AuthResult, BodyFormat, SessionNotice, StatusBody, WireBody};
pub use buffer::{ByteBuffer, ByteOrder};
pub use codec::{Compression, FrameCodec, Identity, JsonCodec};
pub use errors::{CoreError, Result};
pub use header::{Header, now_millis};
pub use ids::RequestIdGenerator;
pub use message::Message;
pub use protocol::ProtocolKey;

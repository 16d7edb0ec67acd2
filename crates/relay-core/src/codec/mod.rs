//! Wire codecs: length-prefixed frames for byte sockets, JSON envelopes for
//! WebSocket text frames.

pub mod compression;
pub mod frame;
pub mod json;

pub use compression::{Compression, Identity};
pub use frame::{DEFAULT_MAX_FRAME_LEN, FrameCodec};
pub use json::JsonCodec;

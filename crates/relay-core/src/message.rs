//! A header plus an opaque body.

use bytes::Bytes;

use crate::body::{BodyFormat, WireBody};
use crate::buffer::ByteBuffer;
use crate::errors::Result;
use crate::header::Header;
use crate::protocol::ProtocolKey;

/// One decoded or to-be-encoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Routing and identity metadata.
    pub header: Header,
    /// Raw body bytes; structured buffer or JSON text depending on the wire.
    pub body: Bytes,
}

impl Message {
    /// Build a message.
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Message with an empty body.
    pub fn empty(header: Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Encode `body` in `format` and wrap it.
    pub fn with_body<B: WireBody>(header: Header, body: &B, format: BodyFormat) -> Result<Self> {
        Ok(Self::new(header, body.encode(format)?))
    }

    /// Protocol key from the header.
    pub fn key(&self) -> ProtocolKey {
        self.header.key()
    }

    /// Correlation id from the header.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Decode the body as `B`.
    pub fn body<B: WireBody>(&self, format: BodyFormat) -> Result<B> {
        B::decode(&self.body, format)
    }

    /// Reading cursor over a copy of the body.
    pub fn buffer(&self, format: BodyFormat) -> ByteBuffer {
        ByteBuffer::from_bytes(self.body.to_vec(), format.order())
    }

    /// Reply on the same key and request id.
    pub fn reply<B: WireBody>(&self, body: &B, format: BodyFormat) -> Result<Self> {
        Self::with_body(self.header.reply(), body, format)
    }

    /// Reply on another key, keeping the request id.
    pub fn reply_on<B: WireBody>(&self, key: ProtocolKey, body: &B, format: BodyFormat) -> Result<Self> {
        let mut header = self.header.reply();
        header.set_key(key);
        Self::with_body(header, body, format)
    }
}

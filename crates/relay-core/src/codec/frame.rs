//! Length-prefixed frame codec for byte sockets.
//!
//! Layout, every length in the codec's byte order:
//!
//! ```text
//! [TotalLength:4][HeaderLength:4][Header JSON][BodyLength:4][Body]
//! ```
//!
//! `TotalLength` counts everything after itself. Decoding is two-phase: the
//! [`Decoder`] impl waits until a whole frame is buffered (TCP may split or
//! coalesce writes), then [`FrameCodec::parse_frame`] splits it into header
//! and body. A `TotalLength` above the ceiling is rejected before any bytes
//! are buffered for it.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::compression::{Compression, Identity};
use crate::buffer::ByteOrder;
use crate::errors::{CoreError, Result};
use crate::header::Header;
use crate::message::Message;

/// Default ceiling for `TotalLength` (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Width of every length field.
const LEN_FIELD: usize = 4;

/// Encoder/decoder for one byte-socket connection.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
    order: ByteOrder,
    compression: Arc<dyn Compression>,
    compress_threshold: Option<usize>,
}

impl FrameCodec {
    /// Big-endian codec with the default ceiling and no compression.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_FRAME_LEN, ByteOrder::Big)
    }

    /// Codec with a custom ceiling and byte order.
    pub fn with_limits(max_frame_len: usize, order: ByteOrder) -> Self {
        Self {
            max_frame_len,
            order,
            compression: Arc::new(Identity),
            compress_threshold: None,
        }
    }

    /// Compress bodies longer than `threshold` bytes with `compression`.
    #[must_use]
    pub fn with_compression(mut self, compression: Arc<dyn Compression>, threshold: usize) -> Self {
        self.compression = compression;
        self.compress_threshold = Some(threshold);
        self
    }

    /// Configured ceiling.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Configured byte order.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    fn get_len(&self, buf: &mut impl Buf, field: &str) -> Result<usize> {
        if buf.remaining() < LEN_FIELD {
            return Err(CoreError::malformed(format!("{field} truncated")));
        }
        let raw = match self.order {
            ByteOrder::Big => buf.get_i32(),
            ByteOrder::Little => buf.get_i32_le(),
        };
        usize::try_from(raw).map_err(|_| CoreError::malformed(format!("{field} is negative ({raw})")))
    }

    fn peek_total(&self, src: &[u8]) -> Result<usize> {
        let mut prefix = &src[..LEN_FIELD];
        self.get_len(&mut prefix, "total length")
    }

    fn put_len(&self, dst: &mut BytesMut, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| CoreError::FrameTooLarge {
            len,
            max: self.max_frame_len,
        })?;
        match self.order {
            ByteOrder::Big => dst.put_i32(len),
            ByteOrder::Little => dst.put_i32_le(len),
        }
        Ok(())
    }

    /// Split one complete frame (without its `TotalLength` prefix).
    pub fn parse_frame(&self, mut frame: Bytes) -> Result<Message> {
        let header_len = self.get_len(&mut frame, "header length")?;
        if header_len + LEN_FIELD > frame.len() {
            return Err(CoreError::malformed(format!(
                "header length {header_len} overruns frame of {} bytes",
                frame.len()
            )));
        }
        let header_bytes = frame.split_to(header_len);
        let header: Header = serde_json::from_slice(&header_bytes)?;

        let body_len = self.get_len(&mut frame, "body length")?;
        if body_len != frame.len() {
            return Err(CoreError::malformed(format!(
                "body length {body_len} disagrees with {} remaining bytes",
                frame.len()
            )));
        }
        let body = if header.is_compress {
            self.compression.decompress(&frame)?
        } else {
            frame
        };
        Ok(Message { header, body })
    }

    /// Encode a full frame, prefix included.
    pub fn encode_frame(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let compress = self
            .compress_threshold
            .is_some_and(|threshold| message.body.len() > threshold);
        let (header_bytes, body) = if compress {
            let mut header = message.header.clone();
            header.is_compress = true;
            (serde_json::to_vec(&header)?, self.compression.compress(&message.body)?)
        } else {
            (serde_json::to_vec(&message.header)?, message.body.clone())
        };

        let total = LEN_FIELD + header_bytes.len() + LEN_FIELD + body.len();
        if total > self.max_frame_len {
            return Err(CoreError::FrameTooLarge {
                len: total,
                max: self.max_frame_len,
            });
        }
        dst.reserve(LEN_FIELD + total);
        self.put_len(dst, total)?;
        self.put_len(dst, header_bytes.len())?;
        dst.put_slice(&header_bytes);
        self.put_len(dst, body.len())?;
        dst.put_slice(&body);
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < LEN_FIELD {
            return Ok(None);
        }
        let total = self.peek_total(src)?;
        if total > self.max_frame_len {
            return Err(CoreError::FrameTooLarge {
                len: total,
                max: self.max_frame_len,
            });
        }
        if src.len() < LEN_FIELD + total {
            src.reserve(LEN_FIELD + total - src.len());
            return Ok(None);
        }
        src.advance(LEN_FIELD);
        let frame = src.split_to(total).freeze();
        self.parse_frame(frame).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CoreError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::protocol::ProtocolKey;

    fn sample(body: &[u8]) -> Message {
        let mut header = Header::new(ProtocolKey::new(1, 5), 99);
        header.session_id = 42;
        header.user_id = "u1".into();
        Message::new(header, Bytes::copy_from_slice(body))
    }

    fn encode(codec: &FrameCodec, message: &Message) -> BytesMut {
        let mut dst = BytesMut::new();
        codec.encode_frame(message, &mut dst).unwrap();
        dst
    }

    #[test]
    fn encode_then_decode() {
        let mut codec = FrameCodec::new();
        let msg = sample(b"hello");
        let mut buf = encode(&codec, &msg);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn total_length_covers_everything_after_itself() {
        let codec = FrameCodec::new();
        let buf = encode(&codec, &sample(b"abc"));
        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(total, buf.len() - 4);
    }

    #[test]
    fn little_endian_frames() {
        let mut codec = FrameCodec::with_limits(DEFAULT_MAX_FRAME_LEN, ByteOrder::Little);
        let msg = sample(b"le");
        let mut buf = encode(&codec, &msg);
        let total = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(total, buf.len() - 4);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn coalesced_frames_decode_one_at_a_time() {
        let mut codec = FrameCodec::new();
        let first = sample(b"one");
        let second = sample(b"two");
        let mut buf = encode(&codec, &first);
        buf.extend_from_slice(&encode(&codec, &second));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn byte_at_a_time() {
        let mut codec = FrameCodec::new();
        let msg = sample(b"drip");
        let full = encode(&codec, &msg);
        let mut buf = BytesMut::new();
        let mut out = None;
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "frame emitted early at byte {i}");
            } else {
                out = decoded;
            }
        }
        assert_eq!(out.unwrap(), msg);
    }

    #[test]
    fn oversize_total_length_rejected_before_buffering() {
        let mut codec = FrameCodec::with_limits(64, ByteOrder::Big);
        let mut buf = BytesMut::new();
        buf.put_i32(65);
        assert_matches!(
            codec.decode(&mut buf),
            Err(CoreError::FrameTooLarge { len: 65, max: 64 })
        );
    }

    #[test]
    fn oversize_encode_rejected() {
        let codec = FrameCodec::with_limits(32, ByteOrder::Big);
        let mut dst = BytesMut::new();
        assert_matches!(
            codec.encode_frame(&sample(&[0u8; 64]), &mut dst),
            Err(CoreError::FrameTooLarge { .. })
        );
        assert!(dst.is_empty());
    }

    #[test]
    fn negative_total_length_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(-5);
        assert_matches!(codec.decode(&mut buf), Err(CoreError::Malformed { .. }));
    }

    #[test]
    fn header_length_overrun_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(100);
        buf.put_i32(0);
        assert_matches!(codec.decode(&mut buf), Err(CoreError::Malformed { .. }));
    }

    #[test]
    fn unparsable_header_json() {
        let mut codec = FrameCodec::new();
        let header = b"not json";
        let mut buf = BytesMut::new();
        buf.put_i32(i32::try_from(4 + header.len() + 4).unwrap());
        buf.put_i32(i32::try_from(header.len()).unwrap());
        buf.put_slice(header);
        buf.put_i32(0);
        assert_matches!(codec.decode(&mut buf), Err(CoreError::Json(_)));
    }

    #[test]
    fn body_length_mismatch_is_malformed() {
        let codec = FrameCodec::new();
        let mut full = encode(&codec, &sample(b"abcd"));
        // Shrink the declared body length by one.
        let body_len_at = full.len() - 4 - 4;
        full[body_len_at + 3] -= 1;
        let frame = full.split_off(4).freeze();
        assert_matches!(codec.parse_frame(frame), Err(CoreError::Malformed { .. }));
    }

    #[derive(Debug)]
    struct Reverse;

    impl Compression for Reverse {
        fn compress(&self, body: &[u8]) -> Result<Bytes> {
            Ok(body.iter().rev().copied().collect::<Vec<_>>().into())
        }
        fn decompress(&self, body: &[u8]) -> Result<Bytes> {
            self.compress(body)
        }
    }

    #[test]
    fn compression_applies_above_threshold() {
        let mut codec = FrameCodec::new().with_compression(Arc::new(Reverse), 3);
        let msg = sample(b"abcdef");
        let mut buf = encode(&codec, &msg);
        assert!(buf.windows(6).any(|w| w == b"fedcba"));
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.header.is_compress);
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn small_bodies_skip_compression() {
        let mut codec = FrameCodec::new().with_compression(Arc::new(Reverse), 16);
        let mut buf = encode(&codec, &sample(b"abc"));
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.header.is_compress);
        assert_eq!(&decoded.body[..], b"abc");
    }

    proptest! {
        #[test]
        fn any_strict_prefix_needs_more_data(body in proptest::collection::vec(any::<u8>(), 0..512), cut in 0usize..1024) {
            let mut codec = FrameCodec::new();
            let full = encode(&codec, &sample(&body));
            let cut = cut % full.len();
            let mut partial = BytesMut::from(&full[..cut]);
            prop_assert!(codec.decode(&mut partial).unwrap().is_none());
            prop_assert_eq!(partial.len(), cut);
        }

        #[test]
        fn arbitrary_bodies_survive(body in proptest::collection::vec(any::<u8>(), 0..2048), request_id in any::<u64>()) {
            let mut codec = FrameCodec::new();
            let mut msg = sample(&body);
            msg.header.request_id = request_id;
            let mut buf = encode(&codec, &msg);
            prop_assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
        }
    }
}

//! Pluggable body compression.

use std::fmt;

use bytes::Bytes;

use crate::errors::Result;

/// Transforms bodies larger than the codec's threshold.
pub trait Compression: Send + Sync + fmt::Debug {
    /// Compress an outbound body.
    fn compress(&self, body: &[u8]) -> Result<Bytes>;
    /// Reverse [`compress`](Self::compress) for an inbound body.
    fn decompress(&self, body: &[u8]) -> Result<Bytes>;
}

/// Pass-through compression.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Compression for Identity {
    fn compress(&self, body: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(body))
    }

    fn decompress(&self, body: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(body))
    }
}

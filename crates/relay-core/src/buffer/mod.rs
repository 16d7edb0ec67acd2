//! Cursor-based byte buffer with typed read/write primitives.
//!
//! Writes append at the end and return `&mut Self` so a body can be built in
//! one expression. Reads advance a separate cursor and fail with
//! [`CoreError::OutOfBounds`] instead of returning garbage when the buffer
//! runs dry.
//!
//! Nullable values use a `-1` length (or `-1` millis for dates) as the null
//! marker. Structured records are described in [`record`].

pub mod record;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};

pub use record::{BigInt, Decimal, Field, Record, Structured};

/// Epoch millis reserved as the null date marker (`1969-12-31T23:59:59.999Z`).
pub const NULL_DATE_MILLIS: i64 = -1;

/// Default initial capacity for new buffers.
pub const DEFAULT_CAPACITY: usize = 256;

/// Length marker for a null string, byte array, list or number.
const NULL_LEN: i32 = -1;

/// Byte order used for every multi-byte primitive in a buffer or frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Network order.
    #[default]
    Big,
    /// Little-endian.
    Little,
}

/// Growable byte buffer with a read cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
    order: ByteOrder,
}

macro_rules! number_io {
    ($write:ident, $read:ident, $ty:ty) => {
        #[doc = concat!("Append a `", stringify!($ty), "`.")]
        pub fn $write(&mut self, value: $ty) -> &mut Self {
            match self.order {
                ByteOrder::Big => self.data.extend_from_slice(&value.to_be_bytes()),
                ByteOrder::Little => self.data.extend_from_slice(&value.to_le_bytes()),
            }
            self
        }

        #[doc = concat!("Read a `", stringify!($ty), "`.")]
        pub fn $read(&mut self) -> Result<$ty> {
            let raw = self.take_array::<{ std::mem::size_of::<$ty>() }>()?;
            Ok(match self.order {
                ByteOrder::Big => <$ty>::from_be_bytes(raw),
                ByteOrder::Little => <$ty>::from_le_bytes(raw),
            })
        }
    };
}

impl ByteBuffer {
    /// Empty big-endian buffer.
    pub fn new() -> Self {
        Self::with_order(ByteOrder::Big)
    }

    /// Empty buffer with the given byte order.
    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            data: Vec::with_capacity(DEFAULT_CAPACITY),
            read_pos: 0,
            order,
        }
    }

    /// Wrap existing bytes for reading.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, order: ByteOrder) -> Self {
        Self {
            data: bytes.into(),
            read_pos: 0,
            order,
        }
    }

    /// Byte order fixed at construction.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Total bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left between the read cursor and the write end.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Current read cursor.
    pub fn position(&self) -> usize {
        self.read_pos
    }

    /// Move the read cursor back to the start.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// Written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Freeze the written bytes.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(CoreError::OutOfBounds {
                needed: n,
                remaining,
            });
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.data[start..self.read_pos])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    // ── Fixed-width primitives ──────────────────────────────────────

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Append one signed byte.
    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.write_u8(value.to_ne_bytes()[0])
    }

    /// Read one signed byte.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_ne_bytes([self.read_u8()?]))
    }

    number_io!(write_i16, read_i16, i16);
    number_io!(write_i32, read_i32, i32);
    number_io!(write_i64, read_i64, i64);
    number_io!(write_u16, read_u16, u16);
    number_io!(write_u32, read_u32, u32);
    number_io!(write_u64, read_u64, u64);
    number_io!(write_f32, read_f32, f32);
    number_io!(write_f64, read_f64, f64);

    /// Append a bool as a single `0`/`1` byte.
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    /// Read a bool; any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Append a char as its `u32` code point.
    pub fn write_char(&mut self, value: char) -> &mut Self {
        self.write_u32(u32::from(value))
    }

    /// Read a char written by [`write_char`](Self::write_char).
    pub fn read_char(&mut self) -> Result<char> {
        let code = self.read_u32()?;
        char::from_u32(code).ok_or_else(|| CoreError::invalid(format!("invalid char code point {code:#x}")))
    }

    // ── Length-prefixed values ──────────────────────────────────────

    fn write_len(&mut self, len: usize) -> &mut Self {
        // Lengths are bounded by the frame ceiling, far below i32::MAX.
        let len = i32::try_from(len).unwrap_or(i32::MAX);
        self.write_i32(len)
    }

    /// Read a length prefix; `None` for the null marker.
    fn read_len(&mut self) -> Result<Option<usize>> {
        match self.read_i32()? {
            NULL_LEN => Ok(None),
            n if n < 0 => Err(CoreError::invalid(format!("negative length {n}"))),
            n => Ok(Some(n.unsigned_abs() as usize)),
        }
    }

    /// Append raw bytes with a length prefix; `None` writes the null marker.
    pub fn write_opt_bytes(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(bytes) => {
                let _ = self.write_len(bytes.len());
                self.data.extend_from_slice(bytes);
                self
            }
            None => self.write_i32(NULL_LEN),
        }
    }

    /// Append raw bytes with a length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.write_opt_bytes(Some(value))
    }

    /// Read length-prefixed bytes; `None` for the null marker.
    pub fn read_opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_len()? {
            Some(len) => Ok(Some(self.take(len)?.to_vec())),
            None => Ok(None),
        }
    }

    /// Read length-prefixed bytes, rejecting null.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.read_opt_bytes()?
            .ok_or_else(|| CoreError::invalid("unexpected null bytes"))
    }

    /// Append a UTF-8 string; `None` writes the null marker.
    pub fn write_opt_string(&mut self, value: Option<&str>) -> &mut Self {
        self.write_opt_bytes(value.map(str::as_bytes))
    }

    /// Append a UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_opt_bytes(Some(value.as_bytes()))
    }

    /// Read a string; `None` for the null marker.
    pub fn read_opt_string(&mut self) -> Result<Option<String>> {
        match self.read_opt_bytes()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| CoreError::invalid(format!("string is not UTF-8: {e}"))),
            None => Ok(None),
        }
    }

    /// Read a string, rejecting null.
    pub fn read_string(&mut self) -> Result<String> {
        self.read_opt_string()?
            .ok_or_else(|| CoreError::invalid("unexpected null string"))
    }

    /// Append a timestamp as epoch millis; `None` writes [`NULL_DATE_MILLIS`].
    ///
    /// The instant one millisecond before the epoch shares that encoding and
    /// reads back as `None`.
    pub fn write_date(&mut self, value: Option<DateTime<Utc>>) -> &mut Self {
        self.write_i64(value.map_or(NULL_DATE_MILLIS, |d| d.timestamp_millis()))
    }

    /// Read a timestamp written by [`write_date`](Self::write_date).
    pub fn read_date(&mut self) -> Result<Option<DateTime<Utc>>> {
        match self.read_i64()? {
            NULL_DATE_MILLIS => Ok(None),
            millis => DateTime::from_timestamp_millis(millis)
                .map(Some)
                .ok_or_else(|| CoreError::invalid(format!("timestamp {millis} out of range"))),
        }
    }

    /// Append an arbitrary-precision integer; `None` writes the null marker.
    pub fn write_big_int(&mut self, value: Option<&BigInt>) -> &mut Self {
        self.write_opt_bytes(value.map(BigInt::as_bytes))
    }

    /// Read an arbitrary-precision integer.
    pub fn read_big_int(&mut self) -> Result<Option<BigInt>> {
        match self.read_opt_bytes()? {
            Some(bytes) if bytes.is_empty() => Err(CoreError::invalid("empty integer magnitude")),
            Some(bytes) => Ok(Some(BigInt::from_be_bytes(&bytes))),
            None => Ok(None),
        }
    }

    /// Append a decimal as scale then unscaled integer; `None` writes `-1`, `-1`.
    pub fn write_decimal(&mut self, value: Option<&Decimal>) -> &mut Self {
        match value {
            Some(decimal) => {
                let _ = self.write_i32(decimal.scale);
                self.write_big_int(Some(&decimal.unscaled))
            }
            None => self.write_i32(NULL_LEN).write_i32(NULL_LEN),
        }
    }

    /// Read a decimal written by [`write_decimal`](Self::write_decimal).
    pub fn read_decimal(&mut self) -> Result<Option<Decimal>> {
        let scale = self.read_i32()?;
        match self.read_big_int()? {
            Some(unscaled) => Ok(Some(Decimal { unscaled, scale })),
            None if scale == NULL_LEN => Ok(None),
            None => Err(CoreError::invalid(format!(
                "decimal with scale {scale} has null magnitude"
            ))),
        }
    }

    /// Append any serializable value as a JSON string.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self> {
        let text = serde_json::to_string(value)?;
        Ok(self.write_string(&text))
    }

    /// Read a JSON string written by [`write_json`](Self::write_json).
    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let text = self.read_string()?;
        Ok(serde_json::from_str(&text)?)
    }

    // ── Tagged values, lists and records ────────────────────────────

    /// Append one tagged value.
    pub fn write_field(&mut self, field: &Field) -> &mut Self {
        record::write_field(self, field);
        self
    }

    /// Read one tagged value.
    pub fn read_field(&mut self) -> Result<Field> {
        record::read_field(self, 0)
    }

    /// Append a list of tagged values; `None` writes the null marker.
    pub fn write_list(&mut self, items: Option<&[Field]>) -> &mut Self {
        match items {
            Some(items) => {
                let _ = self.write_len(items.len());
                for item in items {
                    record::write_field(self, item);
                }
                self
            }
            None => self.write_i32(NULL_LEN),
        }
    }

    /// Read a list written by [`write_list`](Self::write_list).
    pub fn read_list(&mut self) -> Result<Option<Vec<Field>>> {
        record::read_list(self, 0)
    }

    /// Append a record; `None` writes an absent marker.
    pub fn write_record(&mut self, value: Option<&Record>) -> &mut Self {
        record::write_record(self, value);
        self
    }

    /// Read a record written by [`write_record`](Self::write_record).
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        record::read_record(self, 0)
    }

    /// Append a typed value through its record form.
    pub fn write_struct<T: Structured>(&mut self, value: Option<&T>) -> &mut Self {
        let record = value.map(Structured::to_record);
        self.write_record(record.as_ref())
    }

    /// Read a typed value through its record form.
    pub fn read_struct<T: Structured>(&mut self) -> Result<Option<T>> {
        self.read_record()?.as_ref().map(T::from_record).transpose()
    }

    /// Append a list of typed values as records.
    pub fn write_struct_list<T: Structured>(&mut self, values: &[T]) -> &mut Self {
        let items: Vec<Field> = values.iter().map(|v| Field::Record(v.to_record())).collect();
        self.write_list(Some(items.as_slice()))
    }

    /// Read a list of typed values; a null list reads as empty.
    pub fn read_struct_list<T: Structured>(&mut self) -> Result<Vec<T>> {
        let Some(items) = self.read_list()? else {
            return Ok(Vec::new());
        };
        items
            .iter()
            .map(|item| match item {
                Field::Record(record) => T::from_record(record),
                other => Err(CoreError::invalid(format!(
                    "expected record in list, found {}",
                    other.type_name()
                ))),
            })
            .collect()
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ByteBuffer> for Bytes {
    fn from(buffer: ByteBuffer) -> Self {
        buffer.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn chained_writes_read_back_in_order() {
        let mut buf = ByteBuffer::new();
        let _ = buf
            .write_i32(200)
            .write_string("success")
            .write_bool(true)
            .write_i64(-5)
            .write_f64(1.5);

        assert_eq!(buf.read_i32().unwrap(), 200);
        assert_eq!(buf.read_string().unwrap(), "success");
        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.read_i64().unwrap(), -5);
        assert!((buf.read_f64().unwrap() - 1.5).abs() < f64::EPSILON);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn big_endian_layout() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_i32(1);
        assert_eq!(buf.as_slice(), &[0, 0, 0, 1]);
    }

    #[test]
    fn little_endian_layout() {
        let mut buf = ByteBuffer::with_order(ByteOrder::Little);
        let _ = buf.write_i32(1).write_i16(2);
        assert_eq!(buf.as_slice(), &[1, 0, 0, 0, 2, 0]);
        assert_eq!(buf.read_i32().unwrap(), 1);
        assert_eq!(buf.read_i16().unwrap(), 2);
    }

    #[test]
    fn read_past_end_is_bounds_error() {
        let mut buf = ByteBuffer::from_bytes(vec![0, 1], ByteOrder::Big);
        assert_matches!(
            buf.read_i32(),
            Err(CoreError::OutOfBounds {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn failed_read_does_not_advance_cursor() {
        let mut buf = ByteBuffer::from_bytes(vec![0, 7], ByteOrder::Big);
        assert!(buf.read_i32().is_err());
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.read_i16().unwrap(), 7);
    }

    #[test]
    fn string_length_beyond_buffer_is_rejected() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_i32(100).write_u8(b'a');
        assert_matches!(buf.read_string(), Err(CoreError::OutOfBounds { .. }));
    }

    #[test]
    fn null_string_marker() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_opt_string(None).write_string("");
        assert_eq!(buf.read_opt_string().unwrap(), None);
        assert_eq!(buf.read_opt_string().unwrap(), Some(String::new()));
    }

    #[test]
    fn read_string_rejects_null() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_opt_string(None);
        assert_matches!(buf.read_string(), Err(CoreError::InvalidValue { .. }));
    }

    #[test]
    fn negative_length_other_than_null_is_invalid() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_i32(-7);
        assert_matches!(buf.read_opt_bytes(), Err(CoreError::InvalidValue { .. }));
    }

    #[test]
    fn unicode_string() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_string("héllo 世界").write_char('界');
        assert_eq!(buf.read_string().unwrap(), "héllo 世界");
        assert_eq!(buf.read_char().unwrap(), '界');
    }

    #[test]
    fn invalid_char_code_point() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_u32(0xD800);
        assert_matches!(buf.read_char(), Err(CoreError::InvalidValue { .. }));
    }

    #[test]
    fn dates_and_null_dates() {
        let when = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let mut buf = ByteBuffer::new();
        let _ = buf.write_date(Some(when)).write_date(None);
        assert_eq!(buf.read_date().unwrap(), Some(when));
        assert_eq!(buf.read_date().unwrap(), None);
    }

    #[test]
    fn millisecond_before_epoch_reads_as_null() {
        let reserved = DateTime::from_timestamp_millis(NULL_DATE_MILLIS).unwrap();
        let just_before = DateTime::from_timestamp_millis(-2).unwrap();
        let mut buf = ByteBuffer::new();
        let _ = buf.write_date(Some(reserved)).write_date(Some(just_before));
        assert_eq!(buf.read_date().unwrap(), None);
        assert_eq!(buf.read_date().unwrap(), Some(just_before));
    }

    #[test]
    fn big_int_and_decimal() {
        let big = BigInt::from(-123_456_789_012_345_678_i128);
        let dec = Decimal::new(BigInt::from(31_415_i64), 4);
        let mut buf = ByteBuffer::new();
        let _ = buf
            .write_big_int(Some(&big))
            .write_big_int(None)
            .write_decimal(Some(&dec))
            .write_decimal(None);

        assert_eq!(buf.read_big_int().unwrap(), Some(big));
        assert_eq!(buf.read_big_int().unwrap(), None);
        assert_eq!(buf.read_decimal().unwrap(), Some(dec));
        assert_eq!(buf.read_decimal().unwrap(), None);
    }

    #[test]
    fn json_value() {
        let mut buf = ByteBuffer::new();
        let _ = buf
            .write_json(&serde_json::json!({"content": "hi"}))
            .unwrap();
        let value: serde_json::Value = buf.read_json().unwrap();
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn rewind_rereads() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_u16(9);
        assert_eq!(buf.read_u16().unwrap(), 9);
        buf.rewind();
        assert_eq!(buf.read_u16().unwrap(), 9);
    }

    #[test]
    fn into_bytes_keeps_written_data() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_u8(1).write_u8(2);
        let bytes: Bytes = buf.into();
        assert_eq!(&bytes[..], &[1, 2]);
    }
}

//! Self-describing values for [`ByteBuffer`](super::ByteBuffer).
//!
//! Every value is prefixed by a one-byte type tag so a reader can rebuild a
//! polymorphic payload without knowing its shape. Tag `0` is the null marker.
//!
//! Record layout: presence flag, type name, field count, then for each field
//! its name followed by a tagged value. Records nest through [`Field::Record`]
//! and lists through [`Field::List`].

use chrono::{DateTime, Utc};

use super::ByteBuffer;
use crate::errors::{CoreError, Result};

/// Deepest nesting accepted when reading; guards the reader's stack.
pub const MAX_DEPTH: usize = 32;

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const I8: u8 = 2;
    pub const I16: u8 = 3;
    pub const I32: u8 = 4;
    pub const I64: u8 = 5;
    pub const F32: u8 = 6;
    pub const F64: u8 = 7;
    pub const CHAR: u8 = 8;
    pub const STR: u8 = 9;
    pub const BYTES: u8 = 10;
    pub const DATE: u8 = 11;
    pub const BIG_INT: u8 = 12;
    pub const DECIMAL: u8 = 13;
    pub const LIST: u8 = 14;
    pub const RECORD: u8 = 15;
}

/// Arbitrary-precision integer stored as minimal big-endian two's complement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BigInt(Vec<u8>);

impl BigInt {
    /// Build from big-endian two's-complement bytes; redundant sign bytes are trimmed.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(trim_sign_bytes(bytes))
    }

    /// Big-endian two's-complement representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the value is below zero.
    pub fn is_negative(&self) -> bool {
        self.0.first().is_some_and(|b| b & 0x80 != 0)
    }

    /// Narrow to `i128` when the magnitude fits.
    pub fn to_i128(&self) -> Option<i128> {
        if self.0.len() > 16 {
            return None;
        }
        let fill = if self.is_negative() { 0xFF } else { 0x00 };
        let mut raw = [fill; 16];
        raw[16 - self.0.len()..].copy_from_slice(&self.0);
        Some(i128::from_be_bytes(raw))
    }
}

fn trim_sign_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.is_empty() {
        return vec![0];
    }
    let mut start = 0;
    while start + 1 < bytes.len() {
        let (current, next) = (bytes[start], bytes[start + 1]);
        let redundant = (current == 0x00 && next & 0x80 == 0) || (current == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

impl From<i128> for BigInt {
    fn from(value: i128) -> Self {
        Self::from_be_bytes(&value.to_be_bytes())
    }
}

impl From<i64> for BigInt {
    fn from(value: i64) -> Self {
        Self::from(i128::from(value))
    }
}

/// Decimal value: `unscaled * 10^-scale`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Decimal {
    /// Digits without the decimal point.
    pub unscaled: BigInt,
    /// Number of digits after the decimal point.
    pub scale: i32,
}

impl Decimal {
    /// Build a decimal.
    pub fn new(unscaled: BigInt, scale: i32) -> Self {
        Self { unscaled, scale }
    }
}

/// One tagged value inside a record or list.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed byte.
    I8(i8),
    /// 16-bit integer.
    I16(i16),
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// Single-precision float.
    F32(f32),
    /// Double-precision float.
    F64(f64),
    /// Unicode scalar.
    Char(char),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Timestamp with millisecond precision.
    Date(DateTime<Utc>),
    /// Arbitrary-precision integer.
    BigInt(BigInt),
    /// Decimal.
    Decimal(Decimal),
    /// Ordered list of tagged values.
    List(Vec<Field>),
    /// Nested record.
    Record(Record),
}

impl Field {
    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Char(_) => "char",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Date(_) => "date",
            Self::BigInt(_) => "big_int",
            Self::Decimal(_) => "decimal",
            Self::List(_) => "list",
            Self::Record(_) => "record",
        }
    }

    /// Whether this is [`Field::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for Field {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Field {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<u64> for Field {
    fn from(value: u64) -> Self {
        Self::BigInt(BigInt::from(i128::from(value)))
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<DateTime<Utc>> for Field {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Record> for Field {
    fn from(value: Record) -> Self {
        Self::Record(value)
    }
}

impl From<Vec<Field>> for Field {
    fn from(value: Vec<Field>) -> Self {
        Self::List(value)
    }
}

impl<T: Into<Field>> From<Option<T>> for Field {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Named, ordered field list with a type discriminator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// Type discriminator written ahead of the fields.
    pub type_name: String,
    /// Fields in write order.
    pub fields: Vec<(String, Field)>,
}

impl Record {
    /// Empty record of the given type.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field append.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Field>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// First field with `name`.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// String field, erroring when absent or of another type.
    pub fn str(&self, name: &str) -> Result<&str> {
        match self.get(name) {
            Some(Field::Str(s)) => Ok(s),
            other => Err(self.mismatch(name, "string", other)),
        }
    }

    /// Integer field, accepting any integer width.
    pub fn i64(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(Field::I8(v)) => Ok(i64::from(*v)),
            Some(Field::I16(v)) => Ok(i64::from(*v)),
            Some(Field::I32(v)) => Ok(i64::from(*v)),
            Some(Field::I64(v)) => Ok(*v),
            other => Err(self.mismatch(name, "integer", other)),
        }
    }

    /// Bool field.
    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(Field::Bool(v)) => Ok(*v),
            other => Err(self.mismatch(name, "bool", other)),
        }
    }

    /// Optional date field; null reads as `None`.
    pub fn date(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.get(name) {
            Some(Field::Date(v)) => Ok(Some(*v)),
            Some(Field::Null) => Ok(None),
            other => Err(self.mismatch(name, "date", other)),
        }
    }

    fn mismatch(&self, name: &str, expected: &str, found: Option<&Field>) -> CoreError {
        CoreError::invalid(format!(
            "{}.{name}: expected {expected}, found {}",
            self.type_name,
            found.map_or("nothing", Field::type_name)
        ))
    }
}

/// Types that travel as records.
pub trait Structured: Sized {
    /// Convert to a record.
    fn to_record(&self) -> Record;
    /// Rebuild from a record.
    fn from_record(record: &Record) -> Result<Self>;
}

// ── Encoding ────────────────────────────────────────────────────────

pub(super) fn write_field(buf: &mut ByteBuffer, field: &Field) {
    match field {
        Field::Null => {
            let _ = buf.write_u8(tag::NULL);
        }
        Field::Bool(v) => {
            let _ = buf.write_u8(tag::BOOL).write_bool(*v);
        }
        Field::I8(v) => {
            let _ = buf.write_u8(tag::I8).write_i8(*v);
        }
        Field::I16(v) => {
            let _ = buf.write_u8(tag::I16).write_i16(*v);
        }
        Field::I32(v) => {
            let _ = buf.write_u8(tag::I32).write_i32(*v);
        }
        Field::I64(v) => {
            let _ = buf.write_u8(tag::I64).write_i64(*v);
        }
        Field::F32(v) => {
            let _ = buf.write_u8(tag::F32).write_f32(*v);
        }
        Field::F64(v) => {
            let _ = buf.write_u8(tag::F64).write_f64(*v);
        }
        Field::Char(v) => {
            let _ = buf.write_u8(tag::CHAR).write_char(*v);
        }
        Field::Str(v) => {
            let _ = buf.write_u8(tag::STR).write_string(v);
        }
        Field::Bytes(v) => {
            let _ = buf.write_u8(tag::BYTES).write_bytes(v);
        }
        Field::Date(v) => {
            let _ = buf.write_u8(tag::DATE).write_date(Some(*v));
        }
        Field::BigInt(v) => {
            let _ = buf.write_u8(tag::BIG_INT).write_big_int(Some(v));
        }
        Field::Decimal(v) => {
            let _ = buf.write_u8(tag::DECIMAL).write_decimal(Some(v));
        }
        Field::List(items) => {
            let _ = buf.write_u8(tag::LIST).write_list(Some(items.as_slice()));
        }
        Field::Record(record) => {
            let _ = buf.write_u8(tag::RECORD);
            write_record(buf, Some(record));
        }
    }
}

pub(super) fn write_record(buf: &mut ByteBuffer, record: Option<&Record>) {
    let Some(record) = record else {
        let _ = buf.write_bool(false);
        return;
    };
    let _ = buf
        .write_bool(true)
        .write_string(&record.type_name)
        .write_i32(i32::try_from(record.fields.len()).unwrap_or(i32::MAX));
    for (name, value) in &record.fields {
        let _ = buf.write_string(name);
        write_field(buf, value);
    }
}

// ── Decoding ────────────────────────────────────────────────────────

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(CoreError::invalid(format!(
            "record nesting deeper than {MAX_DEPTH}"
        )));
    }
    Ok(())
}

fn read_count(buf: &mut ByteBuffer) -> Result<Option<usize>> {
    match buf.read_i32()? {
        -1 => Ok(None),
        n if n < 0 => Err(CoreError::invalid(format!("negative count {n}"))),
        n => {
            let n = n.unsigned_abs() as usize;
            // Every entry needs at least one byte; cheap sanity check before allocating.
            if n > buf.remaining() {
                return Err(CoreError::OutOfBounds {
                    needed: n,
                    remaining: buf.remaining(),
                });
            }
            Ok(Some(n))
        }
    }
}

pub(super) fn read_field(buf: &mut ByteBuffer, depth: usize) -> Result<Field> {
    check_depth(depth)?;
    let field = match buf.read_u8()? {
        tag::NULL => Field::Null,
        tag::BOOL => Field::Bool(buf.read_bool()?),
        tag::I8 => Field::I8(buf.read_i8()?),
        tag::I16 => Field::I16(buf.read_i16()?),
        tag::I32 => Field::I32(buf.read_i32()?),
        tag::I64 => Field::I64(buf.read_i64()?),
        tag::F32 => Field::F32(buf.read_f32()?),
        tag::F64 => Field::F64(buf.read_f64()?),
        tag::CHAR => Field::Char(buf.read_char()?),
        tag::STR => Field::Str(buf.read_string()?),
        tag::BYTES => Field::Bytes(buf.read_bytes()?),
        tag::DATE => buf.read_date()?.map_or(Field::Null, Field::Date),
        tag::BIG_INT => buf.read_big_int()?.map_or(Field::Null, Field::BigInt),
        tag::DECIMAL => buf.read_decimal()?.map_or(Field::Null, Field::Decimal),
        tag::LIST => read_list(buf, depth + 1)?.map_or(Field::Null, Field::List),
        tag::RECORD => read_record(buf, depth + 1)?.map_or(Field::Null, Field::Record),
        other => return Err(CoreError::invalid(format!("unknown field tag {other}"))),
    };
    Ok(field)
}

pub(super) fn read_list(buf: &mut ByteBuffer, depth: usize) -> Result<Option<Vec<Field>>> {
    check_depth(depth)?;
    let Some(count) = read_count(buf)? else {
        return Ok(None);
    };
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_field(buf, depth)?);
    }
    Ok(Some(items))
}

pub(super) fn read_record(buf: &mut ByteBuffer, depth: usize) -> Result<Option<Record>> {
    check_depth(depth)?;
    if !buf.read_bool()? {
        return Ok(None);
    }
    let type_name = buf.read_string()?;
    let count = read_count(buf)?.unwrap_or(0);
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = buf.read_string()?;
        let value = read_field(buf, depth)?;
        fields.push((name, value));
    }
    Ok(Some(Record { type_name, fields }))
}

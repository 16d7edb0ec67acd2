//! Body encodings and the standard system bodies.
//!
//! A body travels either as a structured buffer (byte socket) or as JSON text
//! (WebSocket). [`WireBody`] types know both forms so handlers stay agnostic
//! of the transport their connection arrived on.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffer::{ByteBuffer, ByteOrder};
use crate::errors::{CoreError, Result};

// ── Status code constants ───────────────────────────────────────────

/// Request handled.
pub const OK: i32 = 200;
/// Request body could not be understood.
pub const BAD_REQUEST: i32 = 400;
/// Missing, invalid or mismatched credentials.
pub const UNAUTHORIZED: i32 = 401;
/// Requested entity does not exist.
pub const NOT_FOUND: i32 = 404;
/// Authentication did not complete in time.
pub const AUTH_TIMEOUT: i32 = 408;
/// Connection sat silent past the idle timeout.
pub const IDLE_TIMEOUT: i32 = 440;
/// Unexpected failure while handling.
pub const INTERNAL_ERROR: i32 = 500;
/// Admission gate rejected or the message went stale.
pub const BUSY: i32 = 503;

/// How a connection encodes bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFormat {
    /// Structured buffer with the given byte order.
    Binary(ByteOrder),
    /// JSON text.
    Json,
}

impl BodyFormat {
    /// Big-endian structured buffer.
    pub const fn binary() -> Self {
        Self::Binary(ByteOrder::Big)
    }

    /// Byte order for buffer reads; JSON bodies report the default.
    pub fn order(self) -> ByteOrder {
        match self {
            Self::Binary(order) => order,
            Self::Json => ByteOrder::default(),
        }
    }
}

/// A body type with both a buffer and a JSON form.
pub trait WireBody: Serialize + DeserializeOwned {
    /// Append the buffer form.
    fn write_buffer(&self, buf: &mut ByteBuffer);

    /// Read the buffer form.
    fn read_buffer(buf: &mut ByteBuffer) -> Result<Self>;

    /// Encode in `format`.
    fn encode(&self, format: BodyFormat) -> Result<Bytes> {
        match format {
            BodyFormat::Binary(order) => {
                let mut buf = ByteBuffer::with_order(order);
                self.write_buffer(&mut buf);
                Ok(buf.into_bytes())
            }
            BodyFormat::Json => Ok(Bytes::from(serde_json::to_vec(self)?)),
        }
    }

    /// Decode from `format`.
    fn decode(bytes: &[u8], format: BodyFormat) -> Result<Self> {
        match format {
            BodyFormat::Binary(order) => {
                let mut buf = ByteBuffer::from_bytes(bytes.to_vec(), order);
                Self::read_buffer(&mut buf)
            }
            BodyFormat::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl WireBody for String {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_string(self);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> Result<Self> {
        buf.read_string()
    }
}

/// `{code, message}` reply used for acks, busy and auth errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    /// HTTP-like status code.
    pub code: i32,
    /// Human-readable reason.
    pub message: String,
}

impl StatusBody {
    /// Arbitrary status.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 200 with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(OK, message)
    }

    /// 503 "server is busy".
    pub fn busy() -> Self {
        Self::new(BUSY, "server is busy")
    }

    /// 401 with a reason.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(UNAUTHORIZED, reason)
    }

    /// 408 "auth timeout".
    pub fn auth_timeout() -> Self {
        Self::new(AUTH_TIMEOUT, "auth timeout")
    }

    /// Whether the code is 200.
    pub fn is_ok(&self) -> bool {
        self.code == OK
    }
}

impl WireBody for StatusBody {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_i32(self.code).write_string(&self.message);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> Result<Self> {
        Ok(Self {
            code: buf.read_i32()?,
            message: buf.read_string()?,
        })
    }
}

/// AUTH request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Account to authenticate.
    pub user_id: String,
    /// Secret for that account.
    pub password: String,
}

impl WireBody for AuthRequest {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_string(&self.user_id).write_string(&self.password);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> Result<Self> {
        Ok(Self {
            user_id: buf.read_string()?,
            password: buf.read_string()?,
        })
    }
}

/// AUTH_RESULT body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    /// Status code (200 on success).
    pub code: i32,
    /// Human-readable reason.
    pub message: String,
    /// Issued token on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Session id the connection holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

impl AuthResult {
    /// Successful authentication.
    pub fn success(token: impl Into<String>, session_id: u64) -> Self {
        Self {
            code: OK,
            message: "auth success".into(),
            token: Some(token.into()),
            session_id: Some(session_id),
        }
    }

    /// Failure with status code and reason.
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            token: None,
            session_id: None,
        }
    }
}

impl WireBody for AuthResult {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf
            .write_i32(self.code)
            .write_string(&self.message)
            .write_opt_string(self.token.as_deref())
            .write_u64(self.session_id.unwrap_or(0));
    }

    fn read_buffer(buf: &mut ByteBuffer) -> Result<Self> {
        let code = buf.read_i32()?;
        let message = buf.read_string()?;
        let token = buf.read_opt_string()?;
        // Older peers stop after the token.
        let session_id = if buf.remaining() >= 8 {
            Some(buf.read_u64()?).filter(|id| *id != 0)
        } else {
            None
        };
        Ok(Self {
            code,
            message,
            token,
            session_id,
        })
    }
}

/// NOTIFY_SESSION_ID body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotice {
    /// Session id assigned on connect.
    pub session_id: u64,
}

impl WireBody for SessionNotice {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_u64(self.session_id);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> Result<Self> {
        let session_id = buf.read_u64()?;
        if session_id == 0 {
            return Err(CoreError::invalid("session id 0 is never assigned"));
        }
        Ok(Self { session_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_body_json() {
        let bytes = StatusBody::busy().encode(BodyFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, serde_json::json!({"code": 503, "message": "server is busy"}));
    }

    #[test]
    fn auth_timeout_body() {
        let body = StatusBody::auth_timeout();
        assert_eq!(body.code, 408);
        assert_eq!(body.message, "auth timeout");
    }

    #[test]
    fn auth_request_buffer_layout_is_two_strings() {
        let req = AuthRequest {
            user_id: "u1".into(),
            password: "p".into(),
        };
        let bytes = req.encode(BodyFormat::binary()).unwrap();
        let mut buf = ByteBuffer::from_bytes(bytes.to_vec(), ByteOrder::Big);
        assert_eq!(buf.read_string().unwrap(), "u1");
        assert_eq!(buf.read_string().unwrap(), "p");
    }

    #[test]
    fn auth_request_json_uses_camel_case() {
        let req: AuthRequest =
            AuthRequest::decode(br#"{"userId":"u1","password":"p"}"#, BodyFormat::Json).unwrap();
        assert_eq!(req.user_id, "u1");
    }

    #[test]
    fn auth_result_success_both_formats() {
        let result = AuthResult::success("T", 42);
        for format in [BodyFormat::Json, BodyFormat::binary(), BodyFormat::Binary(ByteOrder::Little)] {
            let bytes = result.encode(format).unwrap();
            assert_eq!(AuthResult::decode(&bytes, format).unwrap(), result);
        }
    }

    #[test]
    fn auth_result_failure_omits_token_in_json() {
        let bytes = AuthResult::failure(UNAUTHORIZED, "bad password")
            .encode(BodyFormat::Json)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("token").is_none());
        assert_eq!(value["code"], 401);
    }

    #[test]
    fn auth_result_without_session_field() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_i32(200).write_string("auth success").write_string("T");
        let result = AuthResult::read_buffer(&mut buf).unwrap();
        assert_eq!(result.token.as_deref(), Some("T"));
        assert_eq!(result.session_id, None);
    }

    #[test]
    fn session_notice_rejects_zero() {
        let bytes = SessionNotice { session_id: 0 }
            .encode(BodyFormat::binary())
            .unwrap();
        assert!(SessionNotice::decode(&bytes, BodyFormat::binary()).is_err());
    }

    #[test]
    fn string_body_is_pong() {
        let bytes = "pong".to_owned().encode(BodyFormat::Json).unwrap();
        assert_eq!(&bytes[..], b"\"pong\"");
    }
}

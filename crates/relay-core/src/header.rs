//! Message header carried in front of every body.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolKey;

/// Protocol version stamped on headers built by this crate.
pub const DEFAULT_VERSION: &str = "1.0";

/// Milliseconds since the Unix epoch, wall clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Routing and identity metadata for one message.
///
/// `session_id`, `user_id` and `ip` are advisory when they arrive from a
/// peer; the server overwrites them from the owning connection before the
/// message is queued. `rcv_timestamp` is always set by the receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Protocol version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Protocol family.
    pub main_no: u16,
    /// Operation within the family.
    pub sub_no: u16,
    /// Whether the body went through the compression collaborator.
    #[serde(rename = "isCompress", default)]
    pub is_compress: bool,
    /// Server-assigned session id.
    #[serde(default)]
    pub session_id: u64,
    /// Correlation id chosen by the requester.
    #[serde(default)]
    pub request_id: u64,
    /// Receive time in epoch millis.
    #[serde(default)]
    pub rcv_timestamp: i64,
    /// Claimed user identity.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    /// Bearer token issued at AUTH.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Peer address as seen by the server.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}

impl Header {
    /// Header for `key` with the given correlation id.
    pub fn new(key: ProtocolKey, request_id: u64) -> Self {
        Self {
            version: default_version(),
            main_no: key.main_no,
            sub_no: key.sub_no,
            is_compress: false,
            session_id: 0,
            request_id,
            rcv_timestamp: 0,
            user_id: String::new(),
            token: String::new(),
            ip: String::new(),
        }
    }

    /// The protocol key this header addresses.
    pub fn key(&self) -> ProtocolKey {
        ProtocolKey::new(self.main_no, self.sub_no)
    }

    /// Retarget the header at another protocol.
    pub fn set_key(&mut self, key: ProtocolKey) {
        self.main_no = key.main_no;
        self.sub_no = key.sub_no;
    }

    /// Record the local receive time.
    pub fn stamp_received(&mut self) {
        self.rcv_timestamp = now_millis();
    }

    /// Milliseconds elapsed between receipt and `now`.
    ///
    /// Unstamped headers report zero.
    pub fn age_millis(&self, now: i64) -> u64 {
        if self.rcv_timestamp <= 0 {
            return 0;
        }
        u64::try_from(now - self.rcv_timestamp).unwrap_or(0)
    }

    /// Header for a reply: same key, session and request id, no identity.
    pub fn reply(&self) -> Self {
        let mut header = Self::new(self.key(), self.request_id);
        header.version.clone_from(&self.version);
        header.session_id = self.session_id;
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_field_names() {
        let mut header = Header::new(ProtocolKey::new(1, 5), 77);
        header.session_id = 42;
        header.rcv_timestamp = 1_700_000_000_000;
        insta::assert_json_snapshot!(header, @r###"
        {
          "version": "1.0",
          "mainNo": 1,
          "subNo": 5,
          "isCompress": false,
          "sessionId": 42,
          "requestId": 77,
          "rcvTimestamp": 1700000000000
        }
        "###);
    }

    #[test]
    fn identity_fields_serialize_when_present() {
        let mut header = Header::new(ProtocolKey::AUTH, 1);
        header.user_id = "u1".into();
        header.token = "T".into();
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["token"], "T");
        assert!(json.get("ip").is_none());
    }

    #[test]
    fn missing_optional_fields_default() {
        let header: Header = serde_json::from_str(r#"{"mainNo":2,"subNo":3}"#).unwrap();
        assert_eq!(header.key(), ProtocolKey::new(2, 3));
        assert_eq!(header.version, DEFAULT_VERSION);
        assert_eq!(header.session_id, 0);
        assert!(header.user_id.is_empty());
    }

    #[test]
    fn age_of_unstamped_header_is_zero() {
        let header = Header::new(ProtocolKey::PING, 1);
        assert_eq!(header.age_millis(now_millis()), 0);
    }

    #[test]
    fn age_measures_from_receipt() {
        let mut header = Header::new(ProtocolKey::PING, 1);
        header.rcv_timestamp = 10_000;
        assert_eq!(header.age_millis(16_500), 6_500);
        assert_eq!(header.age_millis(9_000), 0);
    }

    #[test]
    fn reply_keeps_correlation_and_drops_identity() {
        let mut header = Header::new(ProtocolKey::new(1, 4), 9);
        header.session_id = 3;
        header.user_id = "bob".into();
        header.token = "tok".into();
        let reply = header.reply();
        assert_eq!(reply.key(), header.key());
        assert_eq!(reply.request_id, 9);
        assert_eq!(reply.session_id, 3);
        assert!(reply.user_id.is_empty());
        assert!(reply.token.is_empty());
    }
}

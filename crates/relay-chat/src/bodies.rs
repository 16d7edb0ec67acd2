//! Request and reply bodies of the chat protocols.

use relay_core::body::{NOT_FOUND, OK};
use relay_core::{ByteBuffer, CoreError, WireBody};
use serde::{Deserialize, Serialize};

use crate::log::ChatMessage;
use crate::users::UserInfo;

/// SAY request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SayRequest {
    /// Text to post.
    pub content: String,
}

impl WireBody for SayRequest {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_string(&self.content);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> relay_core::Result<Self> {
        Ok(Self {
            content: buf.read_string()?,
        })
    }
}

/// GET_USER_INFO request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfoRequest {
    /// Account to look up.
    pub target_id: String,
}

impl WireBody for UserInfoRequest {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_string(&self.target_id);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> relay_core::Result<Self> {
        Ok(Self {
            target_id: buf.read_string()?,
        })
    }
}

/// ONLINE reply: status plus recent history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineReply {
    /// Status code.
    pub code: i32,
    /// Reason.
    pub message: String,
    /// Latest log lines, oldest first.
    pub recent_messages: Vec<ChatMessage>,
}

impl OnlineReply {
    /// Successful reply carrying `recent_messages`.
    pub fn success(recent_messages: Vec<ChatMessage>) -> Self {
        Self {
            code: OK,
            message: "success".into(),
            recent_messages,
        }
    }
}

impl WireBody for OnlineReply {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf
            .write_i32(self.code)
            .write_string(&self.message)
            .write_struct_list(&self.recent_messages);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> relay_core::Result<Self> {
        Ok(Self {
            code: buf.read_i32()?,
            message: buf.read_string()?,
            recent_messages: buf.read_struct_list()?,
        })
    }
}

/// GET_USER_LIST reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserListReply {
    /// Status code.
    pub code: i32,
    /// Reason.
    pub message: String,
    /// Online users.
    pub users: Vec<UserInfo>,
}

impl UserListReply {
    /// Successful reply listing `users`.
    pub fn success(users: Vec<UserInfo>) -> Self {
        Self {
            code: OK,
            message: "success".into(),
            users,
        }
    }
}

impl WireBody for UserListReply {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf
            .write_i32(self.code)
            .write_string(&self.message)
            .write_struct_list(&self.users);
    }

    fn read_buffer(buf: &mut ByteBuffer) -> relay_core::Result<Self> {
        Ok(Self {
            code: buf.read_i32()?,
            message: buf.read_string()?,
            users: buf.read_struct_list()?,
        })
    }
}

/// GET_USER_INFO reply; `user` is absent on 404.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoReply {
    /// Status code.
    pub code: i32,
    /// Reason.
    pub message: String,
    /// The account, when found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

impl UserInfoReply {
    /// Found `user`, or the 404 form.
    pub fn from_lookup(user: Option<UserInfo>) -> Self {
        match user {
            Some(user) => Self {
                code: OK,
                message: "success".into(),
                user: Some(user),
            },
            None => Self {
                code: NOT_FOUND,
                message: "user not found".into(),
                user: None,
            },
        }
    }
}

impl WireBody for UserInfoReply {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf
            .write_i32(self.code)
            .write_string(&self.message)
            .write_struct(self.user.as_ref());
    }

    fn read_buffer(buf: &mut ByteBuffer) -> relay_core::Result<Self> {
        Ok(Self {
            code: buf.read_i32()?,
            message: buf.read_string()?,
            user: buf.read_struct()?,
        })
    }
}

/// MESSAGE broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// The logged line.
    pub message: ChatMessage,
}

impl WireBody for MessageEvent {
    fn write_buffer(&self, buf: &mut ByteBuffer) {
        let _ = buf.write_struct(Some(&self.message));
    }

    fn read_buffer(buf: &mut ByteBuffer) -> relay_core::Result<Self> {
        let message = buf
            .read_struct()?
            .ok_or_else(|| CoreError::malformed("message event without message"))?;
        Ok(Self { message })
    }
}

#[cfg(test)]
mod tests {
    use relay_core::{BodyFormat, ByteOrder};

    use super::*;
    use crate::log::{ChatLog, MessageKind};

    #[test]
    fn online_reply_in_both_formats() {
        let log = ChatLog::default();
        let _ = log.push(MessageKind::Chat, "alice", "hi");
        let _ = log.push(MessageKind::Online, "bob", "bob is online");
        let reply = OnlineReply::success(log.recent(10));
        for format in [BodyFormat::Json, BodyFormat::Binary(ByteOrder::Little)] {
            let bytes = reply.encode(format).unwrap();
            let back = OnlineReply::decode(&bytes, format).unwrap();
            assert_eq!(back.recent_messages.len(), 2);
            assert_eq!(back.recent_messages[1].kind, MessageKind::Online);
        }
    }

    #[test]
    fn missing_user_is_not_found() {
        let reply = UserInfoReply::from_lookup(None);
        assert_eq!(reply.code, 404);
        let bytes = reply.encode(BodyFormat::binary()).unwrap();
        assert_eq!(UserInfoReply::decode(&bytes, BodyFormat::binary()).unwrap().user, None);
        let json: serde_json::Value = serde_json::from_slice(&reply.encode(BodyFormat::Json).unwrap()).unwrap();
        assert!(json.get("user").is_none());
    }

    #[test]
    fn user_info_request_json_field_name() {
        let body = UserInfoRequest::decode(br#"{"targetId":"U001"}"#, BodyFormat::Json).unwrap();
        assert_eq!(body.target_id, "U001");
    }

    #[test]
    fn empty_message_event_is_malformed() {
        let mut buf = ByteBuffer::new();
        let _ = buf.write_struct::<ChatMessage>(None);
        let bytes = buf.into_bytes();
        assert!(MessageEvent::decode(&bytes, BodyFormat::binary()).is_err());
    }

    #[test]
    fn user_info_reply_json_shape() {
        let reply = UserInfoReply::from_lookup(Some(UserInfo {
            user_id: "U001".into(),
            display_name: "Ming".into(),
            online: true,
            last_seen: None,
        }));
        insta::assert_json_snapshot!(reply, @r###"
        {
          "code": 200,
          "message": "success",
          "user": {
            "userId": "U001",
            "displayName": "Ming",
            "online": true,
            "lastSeen": null
          }
        }
        "###);
    }
}

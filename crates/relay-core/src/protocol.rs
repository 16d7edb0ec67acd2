//! Two-part protocol identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one request/response operation on a shared connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolKey {
    /// Protocol family.
    pub main_no: u16,
    /// Operation within the family.
    pub sub_no: u16,
}

impl ProtocolKey {
    /// Client heartbeat; the server answers with `"pong"` on the same key.
    pub const PING: Self = Self::new(0, 0);
    /// Credential submission.
    pub const AUTH: Self = Self::new(0, 1);
    /// Server verdict on an AUTH request or a failed identity check.
    pub const AUTH_RESULT: Self = Self::new(0, 2);
    /// Server tells a fresh connection its session id.
    pub const NOTIFY_SESSION_ID: Self = Self::new(0, 126);
    /// Server-initiated graceful close notice.
    pub const DISCONNECT: Self = Self::new(0, 127);

    /// Build a key.
    pub const fn new(main_no: u16, sub_no: u16) -> Self {
        Self { main_no, sub_no }
    }

    /// Whether this key belongs to the reserved system family.
    pub const fn is_system(self) -> bool {
        self.main_no == 0
    }
}

impl fmt::Display for ProtocolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.main_no, self.sub_no)
    }
}

impl From<(u16, u16)> for ProtocolKey {
    fn from((main_no, sub_no): (u16, u16)) -> Self {
        Self::new(main_no, sub_no)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn reserved_keys_are_distinct() {
        let keys: HashSet<_> = [
            ProtocolKey::PING,
            ProtocolKey::AUTH,
            ProtocolKey::AUTH_RESULT,
            ProtocolKey::NOTIFY_SESSION_ID,
            ProtocolKey::DISCONNECT,
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn equality_uses_both_fields() {
        assert_eq!(ProtocolKey::new(1, 5), ProtocolKey::from((1, 5)));
        assert_ne!(ProtocolKey::new(1, 5), ProtocolKey::new(5, 1));
    }

    #[test]
    fn display_format() {
        assert_eq!(ProtocolKey::new(1, 5).to_string(), "1-5");
    }

    #[test]
    fn system_family() {
        assert!(ProtocolKey::AUTH.is_system());
        assert!(!ProtocolKey::new(1, 1).is_system());
    }
}

//! Accounts and the online set.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relay_core::AuthRequest;
use relay_core::buffer::{Record, Structured};
use relay_server::{AuthError, CredentialVerifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{ChatError, Result};

/// A registered account.
#[derive(Clone, Debug)]
pub struct Account {
    /// Login name.
    pub user_id: String,
    /// Plain secret; this store is a demo.
    pub password: String,
    /// Name shown to other users.
    pub display_name: String,
}

impl Account {
    /// Account whose display name is its login.
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            password: password.into(),
        }
    }

    /// Override the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Parse `name:password`, the `--seed-user` form.
    pub fn parse_seed(spec: &str) -> Result<Self> {
        match spec.split_once(':') {
            Some((user, password)) if !user.is_empty() && !password.is_empty() => {
                Ok(Self::new(user, password))
            }
            _ => Err(ChatError::InvalidSeed(spec.to_owned())),
        }
    }
}

/// Public view of an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Login name.
    pub user_id: String,
    /// Name shown to other users.
    pub display_name: String,
    /// Currently online.
    pub online: bool,
    /// Last time the user went online or offline.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Structured for UserInfo {
    fn to_record(&self) -> Record {
        Record::new("UserInfo")
            .with("userId", self.user_id.as_str())
            .with("displayName", self.display_name.as_str())
            .with("online", self.online)
            .with("lastSeen", self.last_seen)
    }

    fn from_record(record: &Record) -> relay_core::Result<Self> {
        Ok(Self {
            user_id: record.str("userId")?.to_owned(),
            display_name: record.str("displayName")?.to_owned(),
            online: record.bool("online")?,
            last_seen: record.date("lastSeen")?,
        })
    }
}

#[derive(Default)]
struct Inner {
    accounts: BTreeMap<String, Account>,
    online: BTreeSet<String>,
    last_seen: BTreeMap<String, DateTime<Utc>>,
}

/// In-memory account table plus presence.
#[derive(Default)]
pub struct UserStore {
    inner: RwLock<Inner>,
}

impl UserStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the demo accounts `U001`..`U005`.
    pub fn with_demo_accounts() -> Self {
        let store = Self::new();
        for (id, password, name) in [
            ("U001", "password123", "Ming"),
            ("U002", "pass456", "Mei"),
            ("U003", "secret789", "Hua"),
            ("U004", "mypass321", "Fang"),
            ("U005", "test999", "Qiang"),
        ] {
            store.add(Account::new(id, password).with_display_name(name));
        }
        store
    }

    /// Insert or replace an account.
    pub fn add(&self, account: Account) {
        debug!(user_id = %account.user_id, "account added");
        let _ = self
            .inner
            .write()
            .accounts
            .insert(account.user_id.clone(), account);
    }

    /// Whether `user_id` has an account.
    pub fn exists(&self, user_id: &str) -> bool {
        self.inner.read().accounts.contains_key(user_id)
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.inner.read().accounts.len()
    }

    /// No accounts at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().accounts.is_empty()
    }

    /// Check a password.
    pub fn check_password(&self, user_id: &str, password: &str) -> bool {
        self.inner
            .read()
            .accounts
            .get(user_id)
            .is_some_and(|account| account.password == password)
    }

    /// Public view of one account.
    pub fn info(&self, user_id: &str) -> Option<UserInfo> {
        let inner = self.inner.read();
        inner.accounts.get(user_id).map(|account| view(&inner, account))
    }

    /// Display name, falling back to the login.
    pub fn display_name(&self, user_id: &str) -> String {
        self.inner
            .read()
            .accounts
            .get(user_id)
            .map_or_else(|| user_id.to_owned(), |account| account.display_name.clone())
    }

    /// Mark online. Returns `false` if the user already was.
    pub fn mark_online(&self, user_id: &str) -> bool {
        let mut inner = self.inner.write();
        let _ = inner.last_seen.insert(user_id.to_owned(), Utc::now());
        let changed = inner.online.insert(user_id.to_owned());
        if changed {
            info!(user_id, online = inner.online.len(), "user online");
        }
        changed
    }

    /// Mark offline. Returns `false` if the user was not online.
    pub fn mark_offline(&self, user_id: &str) -> bool {
        let mut inner = self.inner.write();
        let changed = inner.online.remove(user_id);
        if changed {
            let _ = inner.last_seen.insert(user_id.to_owned(), Utc::now());
            info!(user_id, online = inner.online.len(), "user offline");
        }
        changed
    }

    /// Whether `user_id` is online.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.read().online.contains(user_id)
    }

    /// Online users, ordered by login.
    pub fn online_users(&self) -> Vec<UserInfo> {
        let inner = self.inner.read();
        inner
            .online
            .iter()
            .filter_map(|id| inner.accounts.get(id))
            .map(|account| view(&inner, account))
            .collect()
    }
}

fn view(inner: &Inner, account: &Account) -> UserInfo {
    UserInfo {
        user_id: account.user_id.clone(),
        display_name: account.display_name.clone(),
        online: inner.online.contains(&account.user_id),
        last_seen: inner.last_seen.get(&account.user_id).copied(),
    }
}

#[async_trait]
impl CredentialVerifier for UserStore {
    async fn verify(&self, request: &AuthRequest) -> std::result::Result<(), AuthError> {
        if self.check_password(&request.user_id, &request.password) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials("invalid user or password".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use relay_core::{ByteBuffer, ByteOrder};

    use super::*;

    fn make_store() -> UserStore {
        let store = UserStore::new();
        store.add(Account::new("alice", "pw").with_display_name("Alice"));
        store.add(Account::new("bob", "hunter2"));
        store
    }

    #[test]
    fn password_check() {
        let store = make_store();
        assert!(store.check_password("alice", "pw"));
        assert!(!store.check_password("alice", "nope"));
        assert!(!store.check_password("carol", "pw"));
    }

    #[test]
    fn presence_transitions_report_changes() {
        let store = make_store();
        assert!(store.mark_online("alice"));
        assert!(!store.mark_online("alice"));
        assert!(store.is_online("alice"));
        assert!(store.mark_offline("alice"));
        assert!(!store.mark_offline("alice"));
        assert!(store.info("alice").unwrap().last_seen.is_some());
    }

    #[test]
    fn online_users_are_sorted_and_known() {
        let store = make_store();
        let _ = store.mark_online("bob");
        let _ = store.mark_online("alice");
        // Unknown ids can be marked but are never listed.
        let _ = store.mark_online("ghost");
        let ids: Vec<_> = store.online_users().into_iter().map(|u| u.user_id).collect();
        assert_eq!(ids, ["alice", "bob"]);
    }

    #[test]
    fn display_name_falls_back_to_login() {
        let store = make_store();
        assert_eq!(store.display_name("alice"), "Alice");
        assert_eq!(store.display_name("bob"), "bob");
        assert_eq!(store.display_name("carol"), "carol");
    }

    #[test]
    fn seed_parsing() {
        let account = Account::parse_seed("dave:secret").unwrap();
        assert_eq!(account.user_id, "dave");
        assert_eq!(account.password, "secret");
        assert_matches!(Account::parse_seed("dave"), Err(ChatError::InvalidSeed(_)));
        assert_matches!(Account::parse_seed(":x"), Err(ChatError::InvalidSeed(_)));
    }

    #[test]
    fn demo_accounts_load() {
        let store = UserStore::with_demo_accounts();
        assert_eq!(store.len(), 5);
        assert!(store.check_password("U001", "password123"));
    }

    #[test]
    fn user_info_travels_as_record() {
        let store = make_store();
        let _ = store.mark_online("alice");
        let info = store.info("alice").unwrap();
        let mut buf = ByteBuffer::with_order(ByteOrder::Big);
        let _ = buf.write_struct(Some(&info));
        let mut read = ByteBuffer::from_bytes(buf.into_bytes().to_vec(), ByteOrder::Big);
        let back: UserInfo = read.read_struct().unwrap().unwrap();
        // Dates travel at millisecond precision.
        assert_eq!(back.user_id, info.user_id);
        assert!(back.online);
        assert_eq!(
            back.last_seen.map(|d| d.timestamp_millis()),
            info.last_seen.map(|d| d.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn verifier_refuses_bad_password() {
        let store = make_store();
        let ok = AuthRequest {
            user_id: "alice".into(),
            password: "pw".into(),
        };
        assert!(store.verify(&ok).await.is_ok());
        let bad = AuthRequest {
            password: "no".into(),
            ..ok
        };
        assert_matches!(store.verify(&bad).await, Err(AuthError::InvalidCredentials(_)));
    }
}

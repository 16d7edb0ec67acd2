//! Response cache for safe replay of retried requests.
//!
//! Keyed by `(user, protocol, requestId)`. A retried request whose response
//! is still cached is answered with the stored message on the I/O path and
//! never reaches the handler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use relay_core::{Message, ProtocolKey};
use relay_settings::CacheSettings;
use tokio::time::Instant;

use crate::metrics::CACHE_ENTRIES;

/// Cache key used for connections that have not authenticated.
pub const GUEST_USER: &str = "guest";

#[derive(Debug)]
struct Entry {
    key: ProtocolKey,
    request_id: u64,
    message: Message,
    inserted: Instant,
}

/// Bounded, time-limited store of outbound responses.
#[derive(Debug)]
pub struct ResponseCache {
    enabled: AtomicBool,
    ttl: Duration,
    max_per_user: usize,
    cacheable: RwLock<HashSet<ProtocolKey>>,
    entries: Mutex<HashMap<String, VecDeque<Entry>>>,
}

fn user_key(user_id: &str) -> &str {
    if user_id.is_empty() { GUEST_USER } else { user_id }
}

impl ResponseCache {
    /// Cache with explicit limits.
    pub fn new(enabled: bool, ttl: Duration, max_per_user: usize) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ttl,
            max_per_user: max_per_user.max(1),
            cacheable: RwLock::new(HashSet::new()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache configured from settings.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.enabled, settings.ttl(), settings.max_per_user)
    }

    /// Mark `keys` as cacheable.
    pub fn include(&self, keys: impl IntoIterator<Item = ProtocolKey>) {
        self.cacheable.write().extend(keys);
    }

    /// Whether responses on `key` are stored.
    pub fn is_cacheable(&self, key: ProtocolKey) -> bool {
        self.is_enabled() && self.cacheable.read().contains(&key)
    }

    /// Global switch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.entries.lock().clear();
            gauge!(CACHE_ENTRIES).set(0.0);
        }
    }

    /// Whether the cache is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Stored response for a retried request, if still fresh.
    pub fn peek(&self, user_id: &str, key: ProtocolKey, request_id: u64) -> Option<Message> {
        if !self.is_enabled() {
            return None;
        }
        let entries = self.entries.lock();
        entries
            .get(user_key(user_id))?
            .iter()
            .find(|e| e.key == key && e.request_id == request_id && e.inserted.elapsed() <= self.ttl)
            .map(|e| e.message.clone())
    }

    /// Store an outbound message for its owner.
    ///
    /// Non-cacheable keys are ignored. A newer response for the same request
    /// replaces the older one; the oldest entry is evicted beyond the per-user
    /// bound. Returns whether the message was stored.
    pub fn put(&self, user_id: &str, message: &Message) -> bool {
        let key = message.key();
        if !self.is_cacheable(key) {
            return false;
        }
        let request_id = message.request_id();
        let mut entries = self.entries.lock();
        let queue = entries.entry(user_key(user_id).to_owned()).or_default();
        queue.retain(|e| !(e.key == key && e.request_id == request_id));
        queue.push_back(Entry {
            key,
            request_id,
            message: message.clone(),
            inserted: Instant::now(),
        });
        while queue.len() > self.max_per_user {
            let _ = queue.pop_front();
        }
        gauge!(CACHE_ENTRIES).set(count(&entries) as f64);
        true
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn update(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = count(&entries);
        for queue in entries.values_mut() {
            queue.retain(|e| e.inserted.elapsed() <= self.ttl);
        }
        entries.retain(|_, queue| !queue.is_empty());
        let after = count(&entries);
        gauge!(CACHE_ENTRIES).set(after as f64);
        before - after
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        count(&self.entries.lock())
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn count(entries: &HashMap<String, VecDeque<Entry>>) -> usize {
    entries.values().map(VecDeque::len).sum()
}

#[cfg(test)]
mod tests {
    use relay_core::Header;

    use super::*;

    const SAY: ProtocolKey = ProtocolKey::new(1, 5);
    const LIST: ProtocolKey = ProtocolKey::new(1, 3);

    fn reply(key: ProtocolKey, request_id: u64, body: &'static str) -> Message {
        Message::new(Header::new(key, request_id), body)
    }

    fn make_cache() -> ResponseCache {
        let cache = ResponseCache::new(true, Duration::from_secs(30), 3);
        cache.include([SAY]);
        cache
    }

    #[test]
    fn put_then_peek() {
        let cache = make_cache();
        assert!(cache.put("alice", &reply(SAY, 1, "ack")));
        let hit = cache.peek("alice", SAY, 1).unwrap();
        assert_eq!(&hit.body[..], b"ack");
        assert!(cache.peek("bob", SAY, 1).is_none());
        assert!(cache.peek("alice", SAY, 2).is_none());
    }

    #[test]
    fn non_cacheable_keys_are_ignored() {
        let cache = make_cache();
        assert!(!cache.put("alice", &reply(LIST, 1, "x")));
        assert!(cache.is_empty());
    }

    #[test]
    fn empty_user_is_guest() {
        let cache = make_cache();
        assert!(cache.put("", &reply(SAY, 4, "g")));
        assert!(cache.peek(GUEST_USER, SAY, 4).is_some());
        assert!(cache.peek("", SAY, 4).is_some());
    }

    #[test]
    fn oldest_entry_evicted_past_bound() {
        let cache = make_cache();
        for id in 1..=4 {
            assert!(cache.put("alice", &reply(SAY, id, "r")));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.peek("alice", SAY, 1).is_none());
        assert!(cache.peek("alice", SAY, 4).is_some());
    }

    #[test]
    fn same_request_replaced_not_duplicated() {
        let cache = make_cache();
        let _ = cache.put("alice", &reply(SAY, 1, "first"));
        let _ = cache.put("alice", &reply(SAY, 1, "second"));
        assert_eq!(cache.len(), 1);
        assert_eq!(&cache.peek("alice", SAY, 1).unwrap().body[..], b"second");
    }

    #[tokio::test(start_paused = true)]
    async fn update_sweeps_expired_entries() {
        let cache = make_cache();
        let _ = cache.put("alice", &reply(SAY, 1, "old"));
        tokio::time::advance(Duration::from_secs(20)).await;
        let _ = cache.put("bob", &reply(SAY, 2, "new"));
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(cache.peek("alice", SAY, 1).is_none());
        assert_eq!(cache.update(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek("bob", SAY, 2).is_some());
    }

    #[test]
    fn disabling_clears_and_bypasses() {
        let cache = make_cache();
        let _ = cache.put("alice", &reply(SAY, 1, "r"));
        cache.set_enabled(false);
        assert!(cache.is_empty());
        assert!(!cache.is_cacheable(SAY));
        assert!(!cache.put("alice", &reply(SAY, 2, "r")));
        assert!(cache.peek("alice", SAY, 1).is_none());
    }

    #[test]
    fn from_settings_uses_limits() {
        let cache = ResponseCache::from_settings(&CacheSettings::default());
        cache.include([SAY]);
        for id in 0..12 {
            let _ = cache.put("alice", &reply(SAY, id, "r"));
        }
        assert_eq!(cache.len(), 10);
    }
}

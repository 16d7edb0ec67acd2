//! Live connection registry and session id assignment.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use relay_core::{BodyFormat, Message, ProtocolKey, WireBody};
use tracing::{debug, info, warn};

use crate::connection::{Connection, TransportHandle, TransportId};
use crate::errors::{Result, ServerError};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL};

/// Callbacks fired after a connection is added or removed.
///
/// Hooks run on the transport task outside the registry lock.
pub trait ConnectionHooks: Send + Sync {
    /// A session was assigned.
    fn on_connect(&self, _registry: &ConnectionRegistry, _connection: &Arc<Connection>) {}

    /// A session was removed.
    fn on_disconnect(&self, _registry: &ConnectionRegistry, _connection: &Arc<Connection>) {}
}

/// Owner of every live [`Connection`].
///
/// Reads are lock-free; `assign` and `remove` serialize on one writer lock so
/// the ceiling check, id minting and insertion happen atomically.
pub struct ConnectionRegistry {
    by_session: DashMap<u64, Arc<Connection>>,
    by_transport: DashMap<TransportId, u64>,
    /// Last minted session id; doubles as the writer lock.
    writer: Mutex<u64>,
    current: AtomicUsize,
    peak: AtomicUsize,
    max_connections: usize,
    version: String,
    hooks: RwLock<Vec<Arc<dyn ConnectionHooks>>>,
}

impl ConnectionRegistry {
    /// Empty registry with a connection ceiling.
    pub fn new(max_connections: usize, version: impl Into<String>) -> Self {
        Self::with_session_seed(max_connections, version, 0)
    }

    /// Registry whose first minted id is `seed + 1` (wrapping).
    pub fn with_session_seed(max_connections: usize, version: impl Into<String>, seed: u64) -> Self {
        Self {
            by_session: DashMap::new(),
            by_transport: DashMap::new(),
            writer: Mutex::new(seed),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            max_connections,
            version: version.into(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Add a lifecycle hook.
    pub fn add_hook(&self, hook: Arc<dyn ConnectionHooks>) {
        self.hooks.write().push(hook);
    }

    /// Create a connection for an accepted socket.
    pub fn assign(&self, handle: TransportHandle) -> Result<Arc<Connection>> {
        let connection = {
            let mut last = self.writer.lock();
            if self.by_session.len() >= self.max_connections {
                counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                warn!(peer = %handle.peer, limit = self.max_connections, "connection limit reached");
                return Err(ServerError::ConnectionLimit {
                    limit: self.max_connections,
                });
            }

            let session_id = loop {
                *last = last.wrapping_add(1);
                if *last != 0 && !self.by_session.contains_key(&*last) {
                    break *last;
                }
            };

            let transport_id = handle.id;
            let connection = Arc::new(Connection::new(handle, session_id, self.version.clone()));
            let _ = self.by_session.insert(session_id, connection.clone());
            let _ = self.by_transport.insert(transport_id, session_id);

            let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = self.peak.fetch_max(current, Ordering::Relaxed);
            connection
        };

        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        info!(
            session_id = connection.session_id,
            peer = %connection.peer,
            transport = connection.transport,
            "session assigned"
        );

        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.on_connect(self, &connection);
        }
        Ok(connection)
    }

    /// Remove the connection bound to `transport_id`.
    pub fn remove(&self, transport_id: TransportId) -> Option<Arc<Connection>> {
        let connection = {
            let _last = self.writer.lock();
            let (_, session_id) = self.by_transport.remove(&transport_id)?;
            let (_, connection) = self.by_session.remove(&session_id)?;
            let _ = self.current.fetch_sub(1, Ordering::Relaxed);
            connection
        };

        connection.close();
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        debug!(session_id = connection.session_id, "session removed");

        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook.on_disconnect(self, &connection);
        }
        Some(connection)
    }

    /// Connection holding `session_id`.
    pub fn lookup_session(&self, session_id: u64) -> Option<Arc<Connection>> {
        self.by_session.get(&session_id).map(|c| c.value().clone())
    }

    /// Connection bound to a transport socket.
    pub fn lookup_transport(&self, transport_id: TransportId) -> Option<Arc<Connection>> {
        let session_id = *self.by_transport.get(&transport_id)?;
        self.lookup_session(session_id)
    }

    /// Snapshot of all live connections.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_session.iter().map(|c| c.value().clone()).collect()
    }

    /// Live connections.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Highest concurrent count seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Configured ceiling.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Send `body` on `key` to every authenticated connection.
    ///
    /// Encodes once per body format. Returns how many sends were accepted.
    pub fn broadcast<B: WireBody>(&self, key: ProtocolKey, body: &B) -> usize {
        let mut encoded: Vec<(BodyFormat, bytes::Bytes)> = Vec::with_capacity(2);
        let mut delivered = 0;
        for connection in self.all() {
            if !connection.is_authenticated() {
                continue;
            }
            let bytes = if let Some((_, b)) = encoded.iter().find(|(f, _)| *f == connection.format) {
                b.clone()
            } else {
                match body.encode(connection.format) {
                    Ok(b) => {
                        encoded.push((connection.format, b.clone()));
                        b
                    }
                    Err(error) => {
                        warn!(protocol = %key, %error, "failed to encode broadcast body");
                        return delivered;
                    }
                }
            };
            let message = Message::new(connection.header(key, 0), bytes);
            if connection.send(message) {
                delivered += 1;
            }
        }
        delivered
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("current", &self.current())
            .field("peak", &self.peak())
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::Outbound;

    fn handle(id: TransportId) -> (TransportHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (
            TransportHandle {
                id,
                peer: "127.0.0.1:50000".parse().unwrap(),
                format: BodyFormat::Json,
                transport: "test",
                tx,
            },
            rx,
        )
    }

    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<u64>>,
        disconnected: Mutex<Vec<u64>>,
    }

    impl ConnectionHooks for Recorder {
        fn on_connect(&self, _registry: &ConnectionRegistry, connection: &Arc<Connection>) {
            self.connected.lock().push(connection.session_id);
        }

        fn on_disconnect(&self, registry: &ConnectionRegistry, connection: &Arc<Connection>) {
            assert!(registry.lookup_session(connection.session_id).is_none());
            self.disconnected.lock().push(connection.session_id);
        }
    }

    #[test]
    fn assign_mints_increasing_ids() {
        let registry = ConnectionRegistry::new(10, "1.0");
        let (h1, _r1) = handle(1);
        let (h2, _r2) = handle(2);
        let a = registry.assign(h1).unwrap();
        let b = registry.assign(h2).unwrap();
        assert_eq!(a.session_id, 1);
        assert_eq!(b.session_id, 2);
        assert_eq!(a.version, "1.0");
        assert_eq!(registry.current(), 2);
        assert_eq!(registry.peak(), 2);
    }

    #[test]
    fn lookups_by_session_and_transport() {
        let registry = ConnectionRegistry::new(10, "1.0");
        let (h, _r) = handle(55);
        let conn = registry.assign(h).unwrap();
        assert_eq!(registry.lookup_session(conn.session_id).unwrap().transport_id, 55);
        assert_eq!(registry.lookup_transport(55).unwrap().session_id, conn.session_id);
        assert!(registry.lookup_transport(56).is_none());
    }

    #[test]
    fn limit_is_checked_before_minting() {
        let registry = ConnectionRegistry::new(1, "1.0");
        let (h1, _r1) = handle(1);
        let (h2, _r2) = handle(2);
        let (h3, _r3) = handle(3);
        let _ = registry.assign(h1).unwrap();
        assert_matches!(registry.assign(h2), Err(ServerError::ConnectionLimit { limit: 1 }));
        let _ = registry.remove(1).unwrap();
        // The rejected attempt did not burn an id.
        assert_eq!(registry.assign(h3).unwrap().session_id, 2);
    }

    #[tokio::test]
    async fn remove_decrements_and_closes() {
        let registry = ConnectionRegistry::new(10, "1.0");
        let (h, mut rx) = handle(1);
        let _ = registry.assign(h).unwrap();
        let removed = registry.remove(1).unwrap();
        assert!(removed.is_closed());
        assert_eq!(registry.current(), 0);
        assert_eq!(registry.peak(), 1);
        assert_matches!(rx.try_recv(), Ok(Outbound::Close));
        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn session_ids_wrap_and_skip_zero_and_live_ids() {
        let registry = ConnectionRegistry::with_session_seed(10, "1.0", u64::MAX - 1);
        let (h1, _r1) = handle(1);
        let (h2, _r2) = handle(2);
        let (h3, _r3) = handle(3);
        let first = registry.assign(h1).unwrap();
        assert_eq!(first.session_id, u64::MAX);
        let second = registry.assign(h2).unwrap();
        assert_eq!(second.session_id, 1);

        // Wrap again past a still-live id.
        *registry.writer.lock() = u64::MAX;
        let third = registry.assign(h3).unwrap();
        assert_eq!(third.session_id, 2);
    }

    #[test]
    fn live_ids_are_unique() {
        let registry = ConnectionRegistry::with_session_seed(64, "1.0", u64::MAX - 8);
        let mut receivers = Vec::new();
        let mut ids = HashSet::new();
        for id in 0..32 {
            let (h, r) = handle(id);
            receivers.push(r);
            assert!(ids.insert(registry.assign(h).unwrap().session_id));
        }
        assert!(!ids.contains(&0));
    }

    #[tokio::test]
    async fn hooks_fire_on_connect_and_disconnect() {
        let registry = ConnectionRegistry::new(10, "1.0");
        let recorder = Arc::new(Recorder::default());
        registry.add_hook(recorder.clone());
        let (h, _r) = handle(9);
        let conn = registry.assign(h).unwrap();
        let _ = registry.remove(9);
        assert_eq!(*recorder.connected.lock(), vec![conn.session_id]);
        assert_eq!(*recorder.disconnected.lock(), vec![conn.session_id]);
    }

    #[tokio::test]
    async fn broadcast_reaches_authenticated_only() {
        let registry = ConnectionRegistry::new(10, "1.0");
        let (h1, mut r1) = handle(1);
        let (h2, mut r2) = handle(2);
        let a = registry.assign(h1).unwrap();
        let _b = registry.assign(h2).unwrap();
        let _ = a.mark_authenticated("alice", "t");

        let sent = registry.broadcast(ProtocolKey::new(1, 6), &"hello".to_string());
        assert_eq!(sent, 1);
        let Ok(Outbound::Frame(message)) = r1.try_recv() else {
            panic!("expected broadcast frame");
        };
        assert_eq!(message.key(), ProtocolKey::new(1, 6));
        assert_eq!(message.header.session_id, a.session_id);
        assert!(r2.try_recv().is_err());
    }
}

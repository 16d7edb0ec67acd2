//! Socket plumbing shared by the TCP and WebSocket listeners.
//!
//! Both transports do the same three things around their own framing: open a
//! connection in the registry, push decoded messages through [`Ingress`], and
//! tear the connection down when the socket ends.

pub mod tcp;
pub mod ws;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};
use relay_core::{BodyFormat, Message, ProtocolKey, SessionNotice};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Outbound, TransportHandle};
use crate::context::ServerContext;
use crate::errors::Result;
use crate::metrics::{CONNECTION_DURATION_SECONDS, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL};
use crate::pipeline::{Ingress, Received};

/// Opens and closes connections on behalf of a transport.
pub struct Acceptor {
    server: Arc<ServerContext>,
    ingress: Ingress,
    next_transport_id: AtomicU64,
}

impl Acceptor {
    /// Acceptor feeding `ingress`.
    pub fn new(server: Arc<ServerContext>, ingress: Ingress) -> Self {
        Self {
            server,
            ingress,
            next_transport_id: AtomicU64::new(1),
        }
    }

    /// Server services.
    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// Register a freshly accepted socket.
    ///
    /// Sends NOTIFY_SESSION_ID and arms the auth timer. Fails at the
    /// connection ceiling; the caller drops the socket.
    pub fn open(
        &self,
        peer: SocketAddr,
        format: BodyFormat,
        transport: &'static str,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Outbound>)> {
        let (tx, rx) = mpsc::channel(self.server.settings.outbound_queue.max(1));
        let handle = TransportHandle {
            id: self.next_transport_id.fetch_add(1, Ordering::Relaxed),
            peer,
            format,
            transport,
            tx,
        };

        let connection = match self.server.registry.assign(handle) {
            Ok(connection) => connection,
            Err(err) => {
                debug!(%peer, transport, "dropping refused socket");
                return Err(err);
            }
        };

        counter!(CONNECTIONS_TOTAL, "transport" => transport).increment(1);

        let notice = SessionNotice {
            session_id: connection.session_id,
        };
        let header = connection.header(ProtocolKey::NOTIFY_SESSION_ID, 0);
        let _ = connection.send_body(header, &notice);
        self.ingress.on_connect(&connection);
        Ok((connection, rx))
    }

    /// Run one decoded message through the receive path.
    pub async fn receive(&self, connection: &Arc<Connection>, message: Message) -> Received {
        self.ingress.receive(connection, message).await
    }

    /// Drop the connection from the registry and record its lifetime.
    pub fn close(&self, connection: &Connection) {
        let _ = self.server.registry.remove(connection.transport_id);
        counter!(DISCONNECTIONS_TOTAL, "transport" => connection.transport).increment(1);
        histogram!(CONNECTION_DURATION_SECONDS, "transport" => connection.transport)
            .record(connection.age().as_secs_f64());
        info!(
            session_id = connection.session_id,
            transport = connection.transport,
            dropped = connection.drop_count(),
            "client disconnected"
        );
    }
}

/// How long a closing session waits for its writer to flush.
pub(crate) const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Give a session's writer [`WRITER_DRAIN`] to finish, then abort it.
///
/// Returns `true` when the writer had to be aborted. A peer that stops
/// reading leaves the writer parked on a send forever otherwise.
pub(crate) async fn drain_writer(session_id: u64, mut writer: JoinHandle<()>) -> bool {
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_ok() {
        return false;
    }
    writer.abort();
    let _ = writer.await;
    warn!(session_id, "writer did not drain in time, aborted");
    true
}

/// Whether an I/O error is an ordinary peer hang-up.
pub(crate) fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Log a socket I/O failure at the level its class deserves.
pub(crate) fn log_io_error(session_id: u64, err: &io::Error) {
    if is_benign(err) {
        debug!(session_id, error = %err, "peer hung up");
    } else {
        error!(session_id, error = %err, "socket error");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use relay_settings::AuthSettings;

    use super::*;
    use crate::auth::{AuthGate, StaticCredentials};

    /// Acceptor with auth disabled and a drained-by-hand inbound queue.
    pub(crate) fn make_acceptor(server: Arc<ServerContext>) -> (Arc<Acceptor>, mpsc::Receiver<crate::pipeline::Queued>) {
        let auth = AuthSettings {
            enabled: false,
            ..AuthSettings::default()
        };
        let gate = AuthGate::new(
            &auth,
            Duration::from_secs(30),
            server.tokens.clone(),
            Arc::new(StaticCredentials::new()),
        );
        let (tx, rx) = mpsc::channel(16);
        let ingress = Ingress::new(gate, server.cache.clone(), tx);
        (Arc::new(Acceptor::new(server, ingress)), rx)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use relay_settings::ServerSettings;

    use super::test_support::make_acceptor;
    use super::*;
    use crate::connection::test_support::next_frame;
    use crate::context::test_support::{make_server_context, make_server_context_with};
    use crate::errors::ServerError;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn open_notifies_session_id() {
        let (acceptor, _queue) = make_acceptor(make_server_context());
        let (conn, mut rx) = acceptor.open(peer(), BodyFormat::Json, "test").unwrap();
        let notice = next_frame(&mut rx);
        assert_eq!(notice.key(), ProtocolKey::NOTIFY_SESSION_ID);
        let body: SessionNotice = notice.body(BodyFormat::Json).unwrap();
        assert_eq!(body.session_id, conn.session_id);
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn open_refuses_past_ceiling() {
        let mut settings = ServerSettings::default();
        settings.max_connections = 1;
        let (acceptor, _queue) = make_acceptor(make_server_context_with(settings));
        let _first = acceptor.open(peer(), BodyFormat::Json, "test").unwrap();
        let second = acceptor.open(peer(), BodyFormat::Json, "test");
        assert_matches!(second, Err(ServerError::ConnectionLimit { limit: 1 }));
    }

    #[tokio::test]
    async fn close_removes_from_registry() {
        let server = make_server_context();
        let (acceptor, _queue) = make_acceptor(server.clone());
        let (conn, _rx) = acceptor.open(peer(), BodyFormat::Json, "test").unwrap();
        assert_eq!(server.registry.current(), 1);
        acceptor.close(&conn);
        assert_eq!(server.registry.current(), 0);
        assert!(conn.is_closed());
        assert!(server.registry.lookup_session(conn.session_id).is_none());
    }

    #[test]
    fn benign_error_classes() {
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_benign(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}

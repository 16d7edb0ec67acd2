//! Services shared by the server's tasks and handed to handlers.

use std::sync::Arc;
use std::time::Instant;

use relay_core::{BodyFormat, Message, ProtocolKey, RequestIdGenerator, WireBody};
use relay_settings::ServerSettings;

use crate::auth::TokenService;
use crate::cache::ResponseCache;
use crate::connection::Connection;
use crate::errors::HandlerError;
use crate::limiter::RateLimiter;
use crate::registry::ConnectionRegistry;

/// Server-wide services. Built once per server; no globals.
pub struct ServerContext {
    /// Effective server settings.
    pub settings: ServerSettings,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Response replay cache.
    pub cache: Arc<ResponseCache>,
    /// Default admission gate.
    pub limiter: Arc<RateLimiter>,
    /// Token issuer/verifier.
    pub tokens: Arc<dyn TokenService>,
    /// Request ids for server-originated messages.
    pub ids: RequestIdGenerator,
    /// When the server was built.
    pub start_time: Instant,
}

impl ServerContext {
    /// Services configured from `settings`.
    pub fn new(settings: ServerSettings, tokens: Arc<dyn TokenService>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            settings.max_connections,
            settings.version.clone(),
        ));
        let cache = Arc::new(ResponseCache::from_settings(&settings.cache));
        let limiter = Arc::new(RateLimiter::from_settings(&settings.rate_limit));
        let ids = RequestIdGenerator::new(settings.worker_id);
        Self {
            settings,
            registry,
            cache,
            limiter,
            tokens,
            ids,
            start_time: Instant::now(),
        }
    }
}

/// What a handler sees: the originating connection plus server services.
#[derive(Clone)]
pub struct HandlerContext {
    connection: Arc<Connection>,
    server: Arc<ServerContext>,
}

impl HandlerContext {
    /// Context for a message received on `connection`.
    pub fn new(connection: Arc<Connection>, server: Arc<ServerContext>) -> Self {
        Self { connection, server }
    }

    /// Originating connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Server services.
    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// Connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.server.registry
    }

    /// Body format of the originating connection.
    pub fn format(&self) -> BodyFormat {
        self.connection.format
    }

    /// Authenticated user of the originating connection.
    pub fn user_id(&self) -> String {
        self.connection.user_id()
    }

    /// Decode the request body in the connection's format.
    pub fn body<B: WireBody>(&self, request: &Message) -> Result<B, HandlerError> {
        Ok(request.body(self.format())?)
    }

    /// Reply to `request` on the same key and request id.
    pub fn reply<B: WireBody>(&self, request: &Message, body: &B) -> Result<Message, HandlerError> {
        let mut message = request.reply(body, self.format())?;
        message.header.session_id = self.connection.session_id;
        message.header.version.clone_from(&self.connection.version);
        Ok(message)
    }

    /// Send through the outbox: cacheable responses are stored before the
    /// non-blocking enqueue.
    pub fn send(&self, message: Message) -> bool {
        let _ = self.server.cache.put(&self.connection.user_id(), &message);
        self.connection.send(message)
    }

    /// Send `body` on `key` to every authenticated connection.
    pub fn broadcast<B: WireBody>(&self, key: ProtocolKey, body: &B) -> usize {
        self.server.registry.broadcast(key, body)
    }

    /// Fresh request id for server-originated messages.
    pub fn next_request_id(&self) -> u64 {
        self.server.ids.next_id()
    }
}


#[cfg(test)]
mod tests {
    use relay_core::{Header, StatusBody};

    use super::test_support::make_server_context;
    use super::*;
    use crate::connection::test_support::{make_connection_with, next_frame};

    const SAY: ProtocolKey = ProtocolKey::new(1, 5);

    #[tokio::test]
    async fn reply_stamps_connection_session() {
        let (conn, _rx) = make_connection_with(12, BodyFormat::Json, 4);
        let ctx = HandlerContext::new(Arc::new(conn), make_server_context());
        let mut header = Header::new(SAY, 3);
        header.session_id = 999;
        let reply = ctx.reply(&Message::empty(header), &StatusBody::ok("success")).unwrap();
        assert_eq!(reply.header.session_id, 12);
        assert_eq!(reply.request_id(), 3);
        assert_eq!(reply.key(), SAY);
    }

    #[tokio::test]
    async fn send_stores_cacheable_responses() {
        let (conn, mut rx) = make_connection_with(12, BodyFormat::Json, 4);
        let conn = Arc::new(conn);
        let _ = conn.mark_authenticated("alice", "t");
        let server = make_server_context();
        server.cache.include([SAY]);
        let ctx = HandlerContext::new(conn, server.clone());

        let reply = ctx.reply(&Message::empty(Header::new(SAY, 3)), &StatusBody::ok("success")).unwrap();
        assert!(ctx.send(reply.clone()));
        assert_eq!(next_frame(&mut rx), reply);
        assert_eq!(server.cache.peek("alice", SAY, 3), Some(reply));
    }

    #[tokio::test]
    async fn body_decodes_in_connection_format() {
        let (conn, _rx) = make_connection_with(1, BodyFormat::binary(), 4);
        let ctx = HandlerContext::new(Arc::new(conn), make_server_context());
        let request = Message::with_body(Header::new(SAY, 1), &"hi".to_string(), BodyFormat::binary()).unwrap();
        let text: String = ctx.body(&request).unwrap();
        assert_eq!(text, "hi");
    }

    #[test]
    fn context_built_from_settings() {
        let mut settings = ServerSettings::default();
        settings.max_connections = 3;
        settings.cache.enabled = false;
        let server = super::test_support::make_server_context_with(settings);
        assert_eq!(server.registry.max_connections(), 3);
        assert!(!server.cache.is_enabled());
        assert!(!server.limiter.is_enabled());
    }
}

//! Chat protocol handlers and the presence hook.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Message, ProtocolKey, StatusBody};
use relay_server::{
    Connection, ConnectionHooks, ConnectionRegistry, HandlerContext, HandlerResult, ProtocolEntry, ProtocolHandler,
    ProtocolTag,
};
use tracing::{debug, info};

use crate::bodies::{MessageEvent, OnlineReply, SayRequest, UserInfoReply, UserInfoRequest, UserListReply};
use crate::log::{ChatLog, MessageKind};
use crate::users::UserStore;

// ── Keys ────────────────────────────────────────────────────────────────────

/// Announce presence; replies with recent history.
pub const ONLINE: ProtocolKey = ProtocolKey::new(1, 1);
/// Leave without closing the connection.
pub const OFFLINE: ProtocolKey = ProtocolKey::new(1, 2);
/// Online users.
pub const GET_USER_LIST: ProtocolKey = ProtocolKey::new(1, 3);
/// One account by id.
pub const GET_USER_INFO: ProtocolKey = ProtocolKey::new(1, 4);
/// Post a chat line.
pub const SAY: ProtocolKey = ProtocolKey::new(1, 5);
/// Server push of a logged line.
pub const MESSAGE: ProtocolKey = ProtocolKey::new(1, 6);

/// Lines returned by ONLINE.
const HISTORY_ON_JOIN: usize = 10;

/// Shared state behind every chat handler.
pub struct ChatService {
    users: Arc<UserStore>,
    log: ChatLog,
}

impl ChatService {
    /// Service over `users` with a log of `log_capacity` lines.
    pub fn new(users: Arc<UserStore>, log_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            users,
            log: ChatLog::new(log_capacity),
        })
    }

    /// Account store, also the credential verifier.
    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    /// Recent chat history.
    pub fn log(&self) -> &ChatLog {
        &self.log
    }

    /// Registration table for every chat protocol.
    pub fn protocols(self: &Arc<Self>) -> Vec<ProtocolEntry> {
        vec![
            ProtocolEntry::new(ProtocolTag::new(ONLINE, "online").cacheable(), Online(self.clone())),
            ProtocolEntry::new(ProtocolTag::new(OFFLINE, "offline").cacheable(), Offline(self.clone())),
            ProtocolEntry::new(
                ProtocolTag::new(GET_USER_LIST, "get user list").cacheable(),
                UserList(self.clone()),
            ),
            ProtocolEntry::new(
                ProtocolTag::new(GET_USER_INFO, "get user info").cacheable(),
                UserInfoLookup(self.clone()),
            ),
            ProtocolEntry::new(ProtocolTag::new(SAY, "say").cacheable(), Say(self.clone())),
        ]
    }

    /// Hook that marks users offline when their last connection drops.
    pub fn presence(self: &Arc<Self>) -> Arc<dyn ConnectionHooks> {
        Arc::new(Presence(self.clone()))
    }

    fn announce(&self, kind: MessageKind, user_id: &str, registry: &ConnectionRegistry) -> usize {
        let name = self.users.display_name(user_id);
        let content = match kind {
            MessageKind::Online => format!("{name} is online"),
            MessageKind::Offline => format!("{name} is offline"),
            MessageKind::Chat => return 0,
        };
        let line = self.log.push(kind, user_id, content);
        registry.broadcast(MESSAGE, &MessageEvent { message: line })
    }
}

/// Send the reply before any broadcast so the caller sees its ack first.
fn ack<B: relay_core::WireBody>(ctx: &HandlerContext, request: &Message, body: &B) -> HandlerResult {
    let reply = ctx.reply(request, body)?;
    let _ = ctx.send(reply);
    Ok(None)
}

// ── Handlers ────────────────────────────────────────────────────────────────

struct Online(Arc<ChatService>);

#[async_trait]
impl ProtocolHandler for Online {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let user_id = ctx.user_id();
        let newly_online = self.0.users.mark_online(&user_id);
        ack(&ctx, &message, &OnlineReply::success(self.0.log.recent(HISTORY_ON_JOIN)))?;
        if newly_online {
            let delivered = self.0.announce(MessageKind::Online, &user_id, ctx.registry());
            debug!(%user_id, delivered, "online broadcast");
        }
        Ok(None)
    }
}

struct Offline(Arc<ChatService>);

#[async_trait]
impl ProtocolHandler for Offline {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let user_id = ctx.user_id();
        let was_online = self.0.users.mark_offline(&user_id);
        ack(&ctx, &message, &StatusBody::ok("success"))?;
        if was_online {
            let _ = self.0.announce(MessageKind::Offline, &user_id, ctx.registry());
        }
        Ok(None)
    }
}

struct UserList(Arc<ChatService>);

#[async_trait]
impl ProtocolHandler for UserList {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let body = UserListReply::success(self.0.users.online_users());
        ctx.reply(&message, &body).map(Some)
    }
}

struct UserInfoLookup(Arc<ChatService>);

#[async_trait]
impl ProtocolHandler for UserInfoLookup {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let request: UserInfoRequest = ctx.body(&message)?;
        let body = UserInfoReply::from_lookup(self.0.users.info(&request.target_id));
        ctx.reply(&message, &body).map(Some)
    }
}

struct Say(Arc<ChatService>);

#[async_trait]
impl ProtocolHandler for Say {
    async fn handle(&self, message: Message, ctx: HandlerContext) -> HandlerResult {
        let request: SayRequest = ctx.body(&message)?;
        let user_id = ctx.user_id();
        info!(
            session_id = message.header.session_id,
            request_id = message.request_id(),
            %user_id,
            "say"
        );
        let line = self.0.log.push(MessageKind::Chat, &user_id, request.content);
        ack(&ctx, &message, &StatusBody::ok("success"))?;
        let _ = ctx.broadcast(MESSAGE, &MessageEvent { message: line });
        Ok(None)
    }
}

// ── Presence ────────────────────────────────────────────────────────────────

struct Presence(Arc<ChatService>);

impl ConnectionHooks for Presence {
    fn on_disconnect(&self, registry: &ConnectionRegistry, connection: &Arc<Connection>) {
        let user_id = connection.user_id();
        if user_id.is_empty() {
            return;
        }
        // The departing connection is already out of the registry.
        let still_here = registry
            .all()
            .iter()
            .any(|other| other.is_authenticated() && other.user_id() == user_id);
        if still_here || !self.0.users.mark_offline(&user_id) {
            return;
        }
        let delivered = self.0.announce(MessageKind::Offline, &user_id, registry);
        debug!(%user_id, delivered, "offline broadcast after disconnect");
    }
}

#[cfg(test)]
mod tests {
    use relay_core::{BodyFormat, Header};
    use relay_server::connection::{Outbound, TransportHandle};
    use relay_server::{JwtTokenService, ServerContext};
    use relay_settings::ServerSettings;
    use tokio::sync::mpsc;

    use super::*;
    use crate::users::Account;

    fn make_service() -> Arc<ChatService> {
        let users = Arc::new(UserStore::new());
        users.add(Account::new("alice", "pw"));
        users.add(Account::new("bob", "pw"));
        ChatService::new(users, 50)
    }

    fn make_server() -> Arc<ServerContext> {
        Arc::new(ServerContext::new(
            ServerSettings::default(),
            Arc::new(JwtTokenService::new(b"test")),
        ))
    }

    /// Register an authenticated JSON connection for `user_id`.
    fn attach(server: &ServerContext, id: u64, user_id: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = TransportHandle {
            id,
            peer: "127.0.0.1:40000".parse().unwrap(),
            format: BodyFormat::Json,
            transport: "test",
            tx,
        };
        let conn = server.registry.assign(handle).unwrap();
        let _ = conn.mark_authenticated(user_id, "t");
        (conn, rx)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(m)) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn every_chat_protocol_is_cacheable_and_safe() {
        let service = make_service();
        let table = service.protocols();
        assert_eq!(table.len(), 5);
        assert!(table.iter().all(|e| e.tag.cacheable && e.tag.safe));
        assert!(table.iter().all(|e| e.tag.key != MESSAGE));
    }

    #[tokio::test]
    async fn say_acks_then_broadcasts() {
        let service = make_service();
        let server = make_server();
        let (alice, mut alice_rx) = attach(&server, 1, "alice");
        let (_bob, mut bob_rx) = attach(&server, 2, "bob");

        let header = Header::new(SAY, 77);
        let request = Message::with_body(header, &SayRequest { content: "hi".into() }, BodyFormat::Json).unwrap();
        let reply = Say(service.clone())
            .handle(request, HandlerContext::new(alice, server.clone()))
            .await
            .unwrap();
        assert!(reply.is_none());

        let to_alice = frames(&mut alice_rx);
        assert_eq!(to_alice[0].key(), SAY);
        assert_eq!(to_alice[0].request_id(), 77);
        assert_eq!(to_alice[1].key(), MESSAGE);

        let to_bob = frames(&mut bob_rx);
        let event: MessageEvent = to_bob[0].body(BodyFormat::Json).unwrap();
        assert_eq!(event.message.content, "hi");
        assert_eq!(event.message.user_id, "alice");
        assert_eq!(service.log().len(), 1);
    }

    #[tokio::test]
    async fn online_is_announced_once() {
        let service = make_service();
        let server = make_server();
        let (alice, mut alice_rx) = attach(&server, 1, "alice");
        let (_bob, mut bob_rx) = attach(&server, 2, "bob");

        for rid in [1, 2] {
            let request = Message::empty(Header::new(ONLINE, rid));
            let _ = Online(service.clone())
                .handle(request, HandlerContext::new(alice.clone(), server.clone()))
                .await
                .unwrap();
        }
        let to_alice = frames(&mut alice_rx);
        let reply: OnlineReply = to_alice[0].body(BodyFormat::Json).unwrap();
        assert_eq!(reply.code, 200);
        assert!(reply.recent_messages.is_empty());
        // One broadcast for the transition; the repeat only gets its ack.
        assert_eq!(frames(&mut bob_rx).len(), 1);
        assert!(service.users().is_online("alice"));
    }

    #[tokio::test]
    async fn user_info_reports_not_found() {
        let service = make_service();
        let server = make_server();
        let (alice, _rx) = attach(&server, 1, "alice");
        let request = Message::with_body(
            Header::new(GET_USER_INFO, 3),
            &UserInfoRequest { target_id: "zed".into() },
            BodyFormat::Json,
        )
        .unwrap();
        let reply = UserInfoLookup(service)
            .handle(request, HandlerContext::new(alice, server))
            .await
            .unwrap()
            .unwrap();
        let body: UserInfoReply = reply.body(BodyFormat::Json).unwrap();
        assert_eq!(body.code, 404);
    }

    #[tokio::test]
    async fn last_disconnect_marks_offline_and_broadcasts() {
        let service = make_service();
        let server = make_server();
        server.registry.add_hook(service.presence());
        let (first, _first_rx) = attach(&server, 1, "alice");
        let (second, _second_rx) = attach(&server, 2, "alice");
        let (_bob, mut bob_rx) = attach(&server, 3, "bob");
        let _ = service.users().mark_online("alice");

        let _ = server.registry.remove(first.transport_id);
        assert!(service.users().is_online("alice"));
        assert!(frames(&mut bob_rx).is_empty());

        let _ = server.registry.remove(second.transport_id);
        assert!(!service.users().is_online("alice"));
        let pushed = frames(&mut bob_rx);
        let event: MessageEvent = pushed[0].body(BodyFormat::Json).unwrap();
        assert_eq!(event.message.kind, MessageKind::Offline);
        assert_eq!(event.message.content, "alice is offline");
    }
}

//! Client against a live server over both transports.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use relay_client::{ClientError, LinkState, RelayClient, TcpConnector, WsConnector};
use relay_core::body::AUTH_TIMEOUT;
use relay_core::{BodyFormat, FrameCodec, JsonCodec, Message, ProtocolKey, StatusBody};
use relay_server::{HandlerContext, ProtocolEntry, ProtocolTag, RelayServer, RunningServer, StaticCredentials, context_fn};
use relay_settings::{ClientSettings, ServerSettings};
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(5);
const SAY: ProtocolKey = ProtocolKey::new(1, 5);

async fn boot_server() -> RunningServer {
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        tcp_port: 0,
        ws_port: 0,
        ..ServerSettings::default()
    };
    let table = vec![ProtocolEntry::new(
        ProtocolTag::new(SAY, "say"),
        context_fn(|m: Message, ctx: HandlerContext| async move {
            let text: String = m.body(ctx.format())?;
            ctx.reply(&m, &StatusBody::ok(format!("{} said {text}", ctx.user_id()))).map(Some)
        }),
    )];
    RelayServer::new(settings)
        .with_verifier(Arc::new(StaticCredentials::new().with_user("alice", "pw")))
        .scan(table)
        .start()
        .await
        .unwrap()
}

fn tcp_client(running: &RunningServer, settings: ClientSettings) -> RelayClient {
    let addr = running.tcp_addr.unwrap().to_string();
    RelayClient::new(settings, Arc::new(TcpConnector::new(addr, FrameCodec::new())))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn tcp_client_authenticates_and_requests() {
    let running = boot_server().await;
    let client = tcp_client(&running, ClientSettings::default());

    let session_id = client.connect().await.unwrap();
    assert_eq!(client.session_id(), Some(session_id));

    let result = client.authenticate("alice", "pw").await.unwrap();
    assert_eq!(result.session_id, Some(session_id));
    assert!(result.token.is_some());

    let reply = client.request(SAY, &"hi".to_owned()).await.unwrap();
    let body: StatusBody = reply.body(BodyFormat::binary()).unwrap();
    assert_eq!(body, StatusBody::ok("alice said hi"));

    let _ = client.ping().await.unwrap();
    assert!(client.rtt().is_some());

    client.disconnect();
    running.shutdown().await;
}

#[tokio::test]
async fn websocket_client_authenticates_and_requests() {
    let running = boot_server().await;
    let url = running.ws_url().unwrap();
    let client = RelayClient::new(
        ClientSettings::default(),
        Arc::new(WsConnector::new(url, JsonCodec::default())),
    );

    let _ = client.connect().await.unwrap();
    let _ = client.authenticate("alice", "pw").await.unwrap();
    let reply = client.request(SAY, &"hello".to_owned()).await.unwrap();
    let body: StatusBody = reply.body(BodyFormat::Json).unwrap();
    assert_eq!(body.message, "alice said hello");

    client.disconnect();
    running.shutdown().await;
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let running = boot_server().await;
    let client = tcp_client(&running, ClientSettings::default());
    let _ = client.connect().await.unwrap();
    assert_matches!(
        client.authenticate("alice", "nope").await,
        Err(ClientError::AuthFailed { code: 401, .. })
    );
    running.shutdown().await;
}

#[tokio::test]
async fn server_kick_marks_client_disconnected() {
    let running = boot_server().await;
    let client = tcp_client(&running, ClientSettings::default());
    let session_id = client.connect().await.unwrap();
    let _ = client.authenticate("alice", "pw").await.unwrap();

    running
        .registry()
        .lookup_session(session_id)
        .unwrap()
        .disconnect(AUTH_TIMEOUT, "kicked");
    wait_until(|| client.state() == LinkState::Disconnected).await;
    assert_matches!(client.send(SAY, &"hi".to_owned()).await, Err(ClientError::NotConnected));

    running.shutdown().await;
}

#[tokio::test]
async fn auto_reconnect_restores_session_and_identity() {
    let running = boot_server().await;
    let settings = ClientSettings {
        auto_reconnect: true,
        reconnect_interval_ms: 50,
        ..ClientSettings::default()
    };
    let client = tcp_client(&running, settings);
    let first = client.connect().await.unwrap();
    let _ = client.authenticate("alice", "pw").await.unwrap();

    running.registry().lookup_session(first).unwrap().close();
    wait_until(|| client.session_id().is_some_and(|id| id != first)).await;
    wait_until(|| {
        client
            .session_id()
            .and_then(|id| running.registry().lookup_session(id))
            .is_some_and(|conn| conn.is_authenticated())
    })
    .await;

    let reply = client.request(SAY, &"again".to_owned()).await.unwrap();
    let body: StatusBody = reply.body(BodyFormat::binary()).unwrap();
    assert_eq!(body.message, "alice said again");
    wait_until(|| client.reconnect_attempts() == 0).await;

    client.disconnect();
    running.shutdown().await;
}

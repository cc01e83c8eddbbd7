#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use paramrelay::config::RelayConfig;
use paramrelay::model::TargetUser;
use paramrelay::relay::Relay;
use paramrelay::store::MemoryStore;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Two users. Alice has a single avatar with a toggle and an invite-only
/// parameter; bob has nothing.
pub const FIXTURE: &str = r#"
    [[users]]
    name = "alice"
    listenKey = "secret"

    [[users.avatars]]
    id = 10
    vrcUuid = "avtr_one"
    name = "Avatar1"

    [[users.avatars.parameters]]
    id = 100
    name = "Speed"
    type = 2
    dataType = 3

    [[users.avatars.parameters]]
    id = 101
    name = "Secret"
    type = 2
    dataType = 3
    requiresInvite = true

    [[users.invites]]
    id = 500
    url = "invite01"
    parameterIds = [101]

    [[users]]
    name = "bob"
    listenKey = "hunter2"
"#;

pub struct TestServer {
    pub addr: SocketAddr,
    pub relay: Relay,
    pub store: Arc<MemoryStore>,
}

pub async fn start_server() -> TestServer {
    start_server_with(RelayConfig::default()).await
}

pub async fn start_server_with(config: RelayConfig) -> TestServer {
    let store = Arc::new(MemoryStore::from_fixture_str(FIXTURE).unwrap());
    let relay = Relay::new(store.clone(), config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_relay = relay.clone();
    tokio::spawn(async move {
        paramrelay::server::run(listener, server_relay, std::future::pending())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer { addr, relay, store }
}

pub fn basic(user: &str, key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{key}"));
    format!("Basic {encoded}")
}

/// Open `/parameter-listen` with credentials but do not handshake.
pub async fn open_listener(addr: SocketAddr, user: &str, key: &str) -> Ws {
    let mut request = format!("ws://{addr}/parameter-listen")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&basic(user, key)).unwrap(),
    );
    let (ws, _) = connect_async(request).await.expect("listener connect failed");
    ws
}

/// Open a listener and complete the version and avatar handshake.
pub async fn connect_listener(server: &TestServer, user: &str, key: &str, avatar: &str) -> Ws {
    let mut ws = open_listener(server.addr, user, key).await;
    let version = recv_text(&mut ws).await;
    assert_eq!(version, server.relay.config().protocol_version);
    ws.send(Message::Text(version.into())).await.unwrap();
    ws.send(Message::Text(avatar.to_string().into())).await.unwrap();
    wait_for_listener(&server.relay, user).await;
    ws
}

/// Open `/parameter-trigger` and present `token`.
pub async fn connect_trigger(addr: SocketAddr, token: &str) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{addr}/parameter-trigger"))
        .await
        .expect("trigger connect failed");
    assert_eq!(recv_json(&mut ws).await, serde_json::json!("Connected"));
    ws.send(Message::Text(token.to_string().into())).await.unwrap();
    ws
}

pub async fn wait_for_listener(relay: &Relay, user: &str) {
    let target = TargetUser::new(user);
    wait_until(|| relay.registry().find_listener(&target).is_some()).await;
}

pub async fn wait_for_triggers(relay: &Relay, user: &str, count: usize) {
    let target = TargetUser::new(user);
    wait_until(|| relay.registry().count_triggers(&target) == count).await;
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next frame that is not a ping or pong.
async fn next_frame(ws: &mut Ws) -> Message {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

pub async fn recv_text(ws: &mut Ws) -> String {
    match next_frame(ws).await {
        Message::Text(text) => text.to_string(),
        other => panic!("expected text message, got {:?}", other),
    }
}

pub async fn recv_json(ws: &mut Ws) -> serde_json::Value {
    serde_json::from_str(&recv_text(ws).await).expect("invalid JSON")
}

/// Skip messages until one satisfies `pred`.
pub async fn recv_matching(
    ws: &mut Ws,
    pred: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    loop {
        let msg = recv_json(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

/// Read until the server closes the socket and return the close reason.
pub async fn recv_close_reason(ws: &mut Ws) -> String {
    loop {
        match next_frame(ws).await {
            Message::Close(Some(frame)) => return frame.reason.to_string(),
            Message::Close(None) => return String::new(),
            _ => continue,
        }
    }
}

pub fn parameter_names(push: &serde_json::Value) -> Vec<String> {
    push["parameters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect()
}

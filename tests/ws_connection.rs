//! Connection-layer tests over a live server: upgrade-time auth close codes,
//! the greeting frame, eviction of a displaced session, and the close on an
//! unrecoverable backend failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use bunch_gateway::auth::jwt::{issue_access_token, JwtVerifier};
use bunch_gateway::routes::build_router;
use bunch_gateway::state::AppState;
use bunch_gateway::store::memory::MemoryStore;
use bunch_gateway::store::{DataStore, MessageRecord, ReactionRecord, StoreError};
use bunch_gateway::topics::TopicKey;

const SECRET: &[u8] = &[9u8; 32];

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_user("u1", "ada");
    store.add_channel("b1", "c1");
    store.add_member("b1", "u1", "member");
    store
}

/// Serve the router on a random port; returns the shared state for
/// asserting on registry and directory contents.
async fn start_server(store: Arc<dyn DataStore>) -> (AppState, SocketAddr) {
    let state = AppState::new(store, Arc::new(JwtVerifier::new(SECRET.to_vec())), 32);
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, addr)
}

fn token(user_id: &str, username: &str) -> String {
    issue_access_token(SECRET, user_id, username).unwrap()
}

async fn connect(addr: SocketAddr, query: &str) -> WsClient {
    let url = format!("ws://{addr}/ws?{query}");
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("WebSocket upgrade failed");
    stream
}

async fn recv(ws: &mut WsClient) -> Message {
    tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("websocket error")
}

async fn recv_json(ws: &mut WsClient) -> Value {
    match recv(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn send_text(ws: &mut WsClient, frame: &str) {
    ws.send(Message::Text(frame.into()))
        .await
        .expect("failed to send frame");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..50 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 1s");
}

#[tokio::test]
async fn connect_without_token_closes_4001() {
    let (_state, addr) = start_server(seeded_store()).await;
    let mut ws = connect(addr, "").await;

    match recv(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(4001));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_with_invalid_token_closes_4002() {
    let (_state, addr) = start_server(seeded_store()).await;
    let mut ws = connect(addr, "token=not-a-jwt").await;

    match recv(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(4002));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn greeting_frame_carries_connection_identity() {
    let (state, addr) = start_server(seeded_store()).await;
    let query = format!("token={}&connection_id=cid-1", token("u1", "ada"));
    let mut ws = connect(addr, &query).await;

    let greeting = recv_json(&mut ws).await;
    assert_eq!(greeting["type"], "connection_established");
    assert_eq!(greeting["connection_id"], "cid-1");
    assert_eq!(greeting["is_keepalive"], false);
    assert!(greeting["server_time"].as_i64().is_some());
    assert!(state.registry.contains("u1", "cid-1"));
}

#[tokio::test]
async fn eviction_closes_old_socket_and_releases_subscriptions() {
    let (state, addr) = start_server(seeded_store()).await;
    let topic = TopicKey::new("b1", "c1");

    let query_a = format!("token={}&connection_id=cid-a", token("u1", "ada"));
    let mut ws_a = connect(addr, &query_a).await;
    assert_eq!(recv_json(&mut ws_a).await["type"], "connection_established");

    send_text(
        &mut ws_a,
        r#"{"type":"subscribe","bunch_id":"b1","channel_id":"c1"}"#,
    )
    .await;
    assert_eq!(recv_json(&mut ws_a).await["type"], "subscribed");
    assert_eq!(state.topics.subscriber_count(&topic), 1);

    // A second connection for the same user displaces the first.
    let query_b = format!("token={}&connection_id=cid-b", token("u1", "ada"));
    let mut ws_b = connect(addr, &query_b).await;
    assert_eq!(recv_json(&mut ws_b).await["type"], "connection_established");

    match recv(&mut ws_a).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(1000));
            assert_eq!(frame.reason.as_str(), "Replaced by new connection");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    // The displaced actor tears down on its own: no client cooperation,
    // no dangling subscription still receiving broadcasts.
    wait_until(|| state.topics.subscriber_count(&topic) == 0).await;
    wait_until(|| state.registry.session_count("u1") == 1).await;
    assert!(state.registry.contains("u1", "cid-b"));
    assert!(!state.registry.contains("u1", "cid-a"));
}

/// Store whose writes fail as if the backend went away mid-session.
struct OutageStore(Arc<MemoryStore>);

#[async_trait]
impl DataStore for OutageStore {
    async fn is_member(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.0.is_member(user_id, bunch_id, channel_id).await
    }

    async fn create_message(
        &self,
        _user_id: &str,
        _bunch_id: &str,
        _channel_id: &str,
        _content: &str,
    ) -> Result<MessageRecord, StoreError> {
        Err(StoreError::Backend("connection pool exhausted".into()))
    }

    async fn create_reaction(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionRecord, StoreError> {
        self.0
            .create_reaction(user_id, bunch_id, message_id, emoji)
            .await
    }

    async fn find_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError> {
        self.0.find_reaction(user_id, message_id, emoji).await
    }

    async fn delete_reaction(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError> {
        self.0
            .delete_reaction(user_id, bunch_id, message_id, emoji)
            .await
    }
}

#[tokio::test]
async fn backend_failure_mid_session_closes_4000() {
    let (_state, addr) = start_server(Arc::new(OutageStore(seeded_store()))).await;

    let query = format!("token={}&connection_id=cid-1", token("u1", "ada"));
    let mut ws = connect(addr, &query).await;
    assert_eq!(recv_json(&mut ws).await["type"], "connection_established");

    send_text(
        &mut ws,
        r#"{"type":"subscribe","bunch_id":"b1","channel_id":"c1"}"#,
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "subscribed");

    send_text(
        &mut ws,
        r#"{"type":"message.new","bunch_id":"b1","channel_id":"c1","content":"hi"}"#,
    )
    .await;

    match recv(&mut ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::from(4000));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

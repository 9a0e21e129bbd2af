#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use messenger_api::auth::sessions::{self, SessionData};
use messenger_api::config::Config;
use messenger_api::db::kv::{KeyValueStore, MemoryStore};
use messenger_api::push::NoopNotifier;
use messenger_api::repo::MemoryRepository;
use messenger_api::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A server running on an ephemeral port over an in-memory repository.
pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
    pub repo: Arc<MemoryRepository>,
}

pub async fn start_server() -> TestApp {
    start_server_with(|_| {}).await
}

/// App state over an in-memory repository and session store.
pub fn test_state(configure: impl FnOnce(&mut Config)) -> (AppState, Arc<MemoryRepository>) {
    let mut config = Config::from_env();
    configure(&mut config);

    let repo = Arc::new(MemoryRepository::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let state = AppState::new(config, repo.clone(), Arc::new(NoopNotifier), kv);
    (state, repo)
}

/// Start a server after adjusting the configuration.
pub async fn start_server_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let (state, repo) = test_state(configure);
    let app = messenger_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp { addr, state, repo }
}

impl TestApp {
    /// Seed a user and a session for them; returns the session token.
    pub async fn login(&self, user_id: &str, display_name: &str) -> String {
        self.repo.add_user(user_id, display_name);
        let token = format!("tok-{user_id}-{}", messenger_common::id::prefixed_ulid(messenger_common::id::prefix::SESSION));
        sessions::store_session(
            self.state.kv.as_ref(),
            &token,
            &SessionData {
                user_id: user_id.to_string(),
            },
        )
        .await
        .expect("store session");
        token
    }

    /// Open `/ws` and wait until the hub has registered the connection.
    pub async fn connect_chat(&self, token: &str) -> Ws {
        let before = self.state.chat_hub.connection_count();
        let ws = self.open("/ws", token).await;
        let hub = self.state.chat_hub.clone();
        wait_until(|| hub.connection_count() > before).await;
        ws
    }

    /// Open `/call/ws` and wait until `user_id` is connected.
    pub async fn connect_call(&self, token: &str, user_id: &str) -> Ws {
        let ws = self.open("/call/ws", token).await;
        let hub = self.state.call_hub.clone();
        let user_id = user_id.to_string();
        wait_until(|| hub.is_connected(&user_id)).await;
        ws
    }

    /// Open a socket with the token in the query string, without waiting for
    /// registration.
    pub async fn open(&self, path: &str, token: &str) -> Ws {
        let url = format!("ws://{}{path}?token={token}", self.addr);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("ws connect");
        ws
    }

    /// Open a socket authenticated by `Authorization: Bearer`.
    pub async fn open_with_bearer(&self, path: &str, token: &str) -> Ws {
        let mut request = format!("ws://{}{path}", self.addr)
            .into_client_request()
            .expect("request");
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("ws connect");
        ws
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !cond() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("parse frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next JSON frame with the given `type`, skipping everything else.
pub async fn next_of_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn next_close_code(ws: &mut Ws) -> u16 {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended before close frame")
            .expect("ws read error");
        match msg {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame without code"),
            _ => continue,
        }
    }
}

/// Assert nothing but control frames arrives for a short while.
pub async fn assert_silent(ws: &mut Ws) {
    let deadline = time::Instant::now() + Duration::from_millis(200);
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Status code of a rejected upgrade.
pub fn rejected_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

//! WebSocket upgrade handlers for both hubs.
//!
//! Authentication happens before the upgrade; a socket only ever exists for
//! a resolved user id.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;

use super::connection;
use super::Hub;
use crate::auth::middleware::AuthUser;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(chat_upgrade))
        .route("/call/ws", get(call_upgrade))
}

async fn chat_upgrade(auth: AuthUser, ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    upgrade(ws, state.chat_hub, auth.user_id)
}

async fn call_upgrade(auth: AuthUser, ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    upgrade(ws, state.call_hub, auth.user_id)
}

fn upgrade<H: Hub + 'static>(ws: WebSocketUpgrade, hub: Arc<H>, user_id: String) -> impl IntoResponse {
    tracing::debug!(user_id = %user_id, "websocket upgrade");
    ws.max_message_size(hub.settings().transport_message_limit())
        .on_upgrade(move |socket| run(socket, hub, user_id))
}

async fn run<H: Hub + 'static>(socket: WebSocket, hub: Arc<H>, user_id: String) {
    let (sink, stream) = socket.split();
    connection::serve(hub.as_ref(), sink, stream, user_id).await;
}

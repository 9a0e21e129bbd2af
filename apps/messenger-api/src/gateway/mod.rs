//! Real-time hubs: chat fan-out and call signaling.

pub mod call;
pub mod call_hub;
pub mod chat_hub;
pub mod connection;
pub mod events;
pub mod registry;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HubError;

use self::connection::Connection;

/// Close codes sent in the final WebSocket close frame.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
pub const CLOSE_SUPERSEDED: u16 = 4002;
pub const CLOSE_SLOW_CONSUMER: u16 = 4008;
pub const CLOSE_LIVENESS_TIMEOUT: u16 = 4009;

/// Tunables shared by both hubs and their connections.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Global ceiling on live connections; the newest is refused past it.
    pub max_connections: usize,
    pub send_queue_capacity: usize,
    pub ping_interval: Duration,
    /// Longest allowed silence from a client before it is dropped.
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_frame_bytes: usize,
    /// Deadline for each repository call made while handling an event.
    pub repo_timeout: Duration,
    pub max_message_length: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            send_queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
            repo_timeout: Duration::from_secs(5),
            max_message_length: 4000,
        }
    }
}

impl HubSettings {
    /// Ceiling handed to the WebSocket codec. It sits above `max_frame_bytes`
    /// so an ordinary oversized frame reaches the read pump and gets 1009;
    /// anything past the ceiling fails in the codec and gets 1002.
    pub fn transport_message_limit(&self) -> usize {
        self.max_frame_bytes.saturating_mul(4)
    }
}

/// What a connection's pumps need from the hub that owns it.
#[async_trait]
pub trait Hub: Send + Sync {
    fn settings(&self) -> &HubSettings;

    /// Admit a connection. On rejection the hub has already closed it.
    async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError>;

    async fn unregister(&self, conn: &Arc<Connection>);

    /// Handle one inbound text frame. Runs on the connection's read task,
    /// so frames from one connection are handled in order.
    async fn handle_frame(&self, conn: &Arc<Connection>, text: &str);
}

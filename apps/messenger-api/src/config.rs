use std::str::FromStr;
use std::time::Duration;

use crate::gateway::call_hub::CallSettings;
use crate::gateway::HubSettings;

/// Messenger API configuration, loaded from environment variables.
///
/// Every variable is optional; a missing or unparsable value falls back to
/// its default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// PostgreSQL connection string. `None` runs on the in-memory repository.
    pub database_url: Option<String>,
    /// Redis holding session records written by the login service. `None`
    /// keeps sessions in process memory.
    pub redis_url: Option<String>,
    /// Global ceiling on live chat connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    pub ping_interval: Duration,
    /// How long a connection may stay silent (no frame, no pong) before it is dropped.
    pub pong_wait: Duration,
    pub write_wait: Duration,
    /// Largest inbound text frame accepted, in bytes.
    pub max_frame_bytes: usize,
    /// Deadline applied to every repository call made by the dispatcher.
    pub repo_timeout: Duration,
    pub max_message_length: usize,
    /// Unanswered calls are ended after this long.
    pub ring_timeout: Duration,
    /// Ended calls stay in the call table this long before eviction.
    pub ended_call_retention: Duration,
    pub call_sweep_interval: Duration,
    /// Webhook that receives push notifications. `None` disables push.
    pub push_webhook_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 8080),
            database_url: optional_var("DATABASE_URL"),
            redis_url: optional_var("REDIS_URL"),
            max_connections: parsed_var("MAX_CONNECTIONS", 10_000),
            send_queue_capacity: parsed_var("SEND_QUEUE_CAPACITY", 256),
            ping_interval: Duration::from_secs(parsed_var("PING_INTERVAL_SECS", 54)),
            pong_wait: Duration::from_secs(parsed_var("PONG_WAIT_SECS", 60)),
            write_wait: Duration::from_secs(parsed_var("WRITE_WAIT_SECS", 10)),
            max_frame_bytes: parsed_var("MAX_FRAME_BYTES", 64 * 1024),
            repo_timeout: Duration::from_secs(parsed_var("REPO_TIMEOUT_SECS", 5)),
            max_message_length: parsed_var("MAX_MESSAGE_LENGTH", 4000),
            ring_timeout: Duration::from_secs(parsed_var("RING_TIMEOUT_SECS", 45)),
            ended_call_retention: Duration::from_secs(parsed_var("ENDED_CALL_RETENTION_SECS", 300)),
            call_sweep_interval: Duration::from_secs(parsed_var("CALL_SWEEP_INTERVAL_SECS", 30)),
            push_webhook_url: optional_var("PUSH_WEBHOOK_URL"),
        }
    }

    /// Settings for the chat hub and its connections.
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            max_connections: self.max_connections,
            send_queue_capacity: self.send_queue_capacity,
            ping_interval: self.ping_interval,
            pong_wait: self.pong_wait,
            write_wait: self.write_wait,
            max_frame_bytes: self.max_frame_bytes,
            repo_timeout: self.repo_timeout,
            max_message_length: self.max_message_length,
        }
    }

    /// Settings for the call-signaling hub.
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            connection: self.hub_settings(),
            ring_timeout: self.ring_timeout,
            ended_call_retention: self.ended_call_retention,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed_var<T: FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match optional_var(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, %default, "invalid value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_var_falls_back_on_garbage() {
        std::env::set_var("MESSENGER_TEST_GARBAGE", "not-a-number");
        assert_eq!(parsed_var("MESSENGER_TEST_GARBAGE", 7usize), 7);
        std::env::remove_var("MESSENGER_TEST_GARBAGE");
    }

    #[test]
    fn parsed_var_reads_value() {
        std::env::set_var("MESSENGER_TEST_PORT", " 9001 ");
        assert_eq!(parsed_var("MESSENGER_TEST_PORT", 80u16), 9001);
        std::env::remove_var("MESSENGER_TEST_PORT");
    }

    #[test]
    fn blank_optional_var_is_none() {
        std::env::set_var("MESSENGER_TEST_BLANK", "   ");
        assert!(optional_var("MESSENGER_TEST_BLANK").is_none());
        std::env::remove_var("MESSENGER_TEST_BLANK");
    }

    #[test]
    fn redis_url_selects_shared_session_store() {
        std::env::set_var("REDIS_URL", "redis://cache:6379/2");
        assert_eq!(Config::from_env().redis_url.as_deref(), Some("redis://cache:6379/2"));
        std::env::remove_var("REDIS_URL");
    }

    #[test]
    fn settings_projection_carries_values() {
        let mut config = Config::from_env();
        config.max_connections = 3;
        config.ring_timeout = Duration::from_secs(9);
        assert_eq!(config.hub_settings().max_connections, 3);
        assert_eq!(config.call_settings().ring_timeout, Duration::from_secs(9));
        assert_eq!(config.call_settings().connection.max_connections, 3);
    }
}

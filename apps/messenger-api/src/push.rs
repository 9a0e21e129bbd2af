//! Push notification bridge.
//!
//! The chat hub calls [`PushNotifier::notify`] on a detached task after a
//! message has been persisted and fanned out. Failures are logged and
//! otherwise ignored.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user_id: &str, title: &str, body: &str, data: Value) -> Result<(), PushError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
    #[error("push endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// Drops every notification.
pub struct NoopNotifier;

#[async_trait]
impl PushNotifier for NoopNotifier {
    async fn notify(&self, _user_id: &str, _title: &str, _body: &str, _data: Value) -> Result<(), PushError> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    user_id: &'a str,
    title: &'a str,
    body: &'a str,
    data: Value,
}

/// POSTs each notification as JSON to a push gateway.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushNotifier for WebhookNotifier {
    async fn notify(&self, user_id: &str, title: &str, body: &str, data: Value) -> Result<(), PushError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&WebhookBody {
                user_id,
                title,
                body,
                data,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PushError::Status(resp.status()));
        }
        Ok(())
    }
}

/// Preview text for a message notification.
pub fn message_preview(content: Option<&str>, file_name: Option<&str>) -> String {
    const MAX_PREVIEW_CHARS: usize = 100;

    match (content.filter(|c| !c.is_empty()), file_name) {
        (Some(text), _) if text.chars().count() > MAX_PREVIEW_CHARS => {
            let mut preview: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
            preview.push('…');
            preview
        }
        (Some(text), _) => text.to_string(),
        (None, Some(name)) => format!("📎 {name}"),
        (None, None) => "📎 Attachment".to_string(),
    }
}

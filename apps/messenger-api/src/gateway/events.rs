//! Wire format for both hubs: closed tagged unions, one variant per event.
//!
//! Chat frames from clients carry their fields flat beside `type`; every
//! other direction wraps fields in `payload`.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::models::chat::Chat;
use crate::models::message::{Message, ReplyPreview};
use crate::models::serialize_i64_as_string;
use crate::models::user::UserSummary;

/// Serialize an outbound event once so it can be shared across recipients.
pub fn encode<T: Serialize>(event: &T) -> Result<Utf8Bytes, serde_json::Error> {
    serde_json::to_string(event).map(Utf8Bytes::from)
}

/// Inbound event names accepted on `/ws`.
pub const CHAT_INBOUND: &[&str] = &[
    "new_message",
    "typing",
    "message_read",
    "message_edited",
    "message_deleted",
    "reaction_added",
    "reaction_removed",
    "message_pinned",
    "message_unpinned",
];

/// Inbound event names accepted on `/call/ws`.
pub const CALL_INBOUND: &[&str] = &[
    "start_call",
    "accept_call",
    "reject_call",
    "hangup",
    "offer",
    "answer",
    "ice",
];

// ---------------------------------------------------------------------------
// Chat: client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    NewMessage {
        chat_id: Option<String>,
        content: Option<String>,
        file_url: Option<String>,
        file_name: Option<String>,
        file_type: Option<String>,
        #[serde(default, deserialize_with = "lenient_message_id")]
        reply_to_id: Option<i64>,
    },
    Typing {
        chat_id: Option<String>,
        #[serde(default = "default_true")]
        is_typing: bool,
    },
    MessageRead {
        chat_id: Option<String>,
    },
    MessageEdited {
        #[serde(default, deserialize_with = "lenient_message_id")]
        message_id: Option<i64>,
        content: Option<String>,
    },
    MessageDeleted {
        #[serde(default, deserialize_with = "lenient_message_id")]
        message_id: Option<i64>,
    },
    ReactionAdded {
        #[serde(default, deserialize_with = "lenient_message_id")]
        message_id: Option<i64>,
        emoji: Option<String>,
    },
    ReactionRemoved {
        #[serde(default, deserialize_with = "lenient_message_id")]
        message_id: Option<i64>,
        emoji: Option<String>,
    },
    MessagePinned {
        chat_id: Option<String>,
        #[serde(default, deserialize_with = "lenient_message_id")]
        message_id: Option<i64>,
    },
    MessageUnpinned {
        chat_id: Option<String>,
        #[serde(default, deserialize_with = "lenient_message_id")]
        message_id: Option<i64>,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::Typing { .. } => "typing",
            Self::MessageRead { .. } => "message_read",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::MessagePinned { .. } => "message_pinned",
            Self::MessageUnpinned { .. } => "message_unpinned",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Message ids are sent back to clients as strings, but clients may echo
/// them either way.
fn lenient_message_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = Option<i64>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a message id as a string or integer")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
            deserializer.deserialize_any(self)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            i64::try_from(v).map(Some).map_err(|_| E::custom("message id out of range"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            if v.is_empty() {
                return Ok(None);
            }
            v.parse().map(Some).map_err(|_| E::custom("message id must be numeric"))
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Decode an inbound frame, turning serde failures into the client-facing
/// validation message.
fn parse_tagged<T: for<'de> Deserialize<'de>>(text: &str, known: &[&str]) -> Result<T, HubError> {
    match serde_json::from_str::<T>(text) {
        Ok(event) => Ok(event),
        Err(err) => {
            let envelope: Envelope =
                serde_json::from_str(text).map_err(|_| HubError::validation("invalid JSON"))?;
            match envelope.kind {
                None => Err(HubError::validation("missing event type")),
                Some(kind) if !known.contains(&kind.as_str()) => {
                    Err(HubError::validation(format!("unknown event type: {kind}")))
                }
                Some(kind) => {
                    tracing::debug!(%err, event = %kind, "malformed event");
                    Err(HubError::validation(format!("invalid {kind} event")))
                }
            }
        }
    }
}

pub fn parse_client_event(text: &str) -> Result<ClientEvent, HubError> {
    parse_tagged(text, CHAT_INBOUND)
}

// ---------------------------------------------------------------------------
// Chat: server → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(MessageView),
    Typing(TypingPayload),
    MessageRead(ReadPayload),
    MessageEdited(Message),
    MessageDeleted(MessageRef),
    ReactionAdded(ReactionPayload),
    ReactionRemoved(ReactionPayload),
    MessagePinned(PinPayload),
    MessageUnpinned(PinPayload),
    ChatCreated(Chat),
    ChatUpdated(Chat),
    MemberAdded(MemberPayload),
    MemberRemoved(MemberPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    Error(ErrorPayload),
}

/// A message plus what clients need to render it without extra lookups.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypingPayload {
    pub chat_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadPayload {
    pub chat_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRef {
    #[serde(serialize_with = "serialize_i64_as_string")]
    pub message_id: i64,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionPayload {
    #[serde(serialize_with = "serialize_i64_as_string")]
    pub message_id: i64,
    pub chat_id: String,
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinPayload {
    pub chat_id: String,
    #[serde(serialize_with = "serialize_i64_as_string")]
    pub message_id: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberPayload {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresencePayload {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    /// Inbound event type that caused the error, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, event: Option<&str>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            event: event.map(str::to_string),
        })
    }
}

// ---------------------------------------------------------------------------
// Calls: both directions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CallClientEvent {
    StartCall {
        peer_id: Option<String>,
    },
    AcceptCall {
        call_id: Option<String>,
    },
    RejectCall {
        call_id: Option<String>,
    },
    Hangup {
        call_id: Option<String>,
    },
    Offer {
        call_id: Option<String>,
        sdp: Option<Value>,
    },
    Answer {
        call_id: Option<String>,
        sdp: Option<Value>,
    },
    Ice {
        call_id: Option<String>,
        candidate: Option<Value>,
    },
}

impl CallClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartCall { .. } => "start_call",
            Self::AcceptCall { .. } => "accept_call",
            Self::RejectCall { .. } => "reject_call",
            Self::Hangup { .. } => "hangup",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
        }
    }
}

pub fn parse_call_event(text: &str) -> Result<CallClientEvent, HubError> {
    parse_tagged(text, CALL_INBOUND)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CallServerEvent {
    IncomingCall {
        call_id: String,
        from_user_id: String,
    },
    CallStarted {
        call_id: String,
        peer_id: String,
    },
    CallAccepted {
        call_id: String,
    },
    CallRejected {
        call_id: String,
    },
    Hangup {
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Offer {
        call_id: String,
        from_user_id: String,
        sdp: Value,
    },
    Answer {
        call_id: String,
        from_user_id: String,
        sdp: Value,
    },
    Ice {
        call_id: String,
        from_user_id: String,
        candidate: Value,
    },
    Error {
        message: String,
    },
}

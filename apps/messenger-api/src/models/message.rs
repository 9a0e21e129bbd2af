use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use super::{serialize_i64_as_string, serialize_option_i64_as_string};
use crate::db::schema::messages;

/// A persisted chat message.
///
/// Ids are snowflakes; they travel as strings because JavaScript clients
/// cannot represent every 64-bit integer.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = messages)]
pub struct Message {
    #[serde(serialize_with = "serialize_i64_as_string")]
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    #[serde(serialize_with = "serialize_option_i64_as_string")]
    pub reply_to_id: Option<i64>,
    pub is_read: bool,
    pub is_deleted: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub reply_to_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            file_url: self.file_url,
            file_name: self.file_name,
            file_type: self.file_type,
            reply_to_id: self.reply_to_id,
            is_read: false,
            is_deleted: false,
            edited_at: None,
            created_at: self.created_at,
        }
    }
}

/// Short quote of a replied-to message, embedded in `new_message` events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyPreview {
    #[serde(serialize_with = "serialize_i64_as_string")]
    pub id: i64,
    pub sender_id: String,
    pub content: Option<String>,
    pub is_deleted: bool,
}

impl From<&Message> for ReplyPreview {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            is_deleted: message.is_deleted,
        }
    }
}

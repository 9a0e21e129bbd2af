use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::{pinned_messages, reactions};

#[derive(Debug, Insertable)]
#[diesel(table_name = reactions)]
pub struct NewReaction<'a> {
    pub message_id: i64,
    pub user_id: &'a str,
    pub emoji: &'a str,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = pinned_messages)]
pub struct NewPin<'a> {
    pub chat_id: &'a str,
    pub message_id: i64,
    pub pinned_by: &'a str,
    pub pinned_at: DateTime<Utc>,
}

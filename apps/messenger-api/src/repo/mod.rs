//! Persistence collaborator consumed by the hubs.
//!
//! The hubs only ever see `Arc<dyn ChatRepository>`. Postgres backs it in
//! production; the in-memory implementation serves tests and database-less
//! development runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepoError;
use crate::models::chat::Chat;
use crate::models::message::{Message, NewMessage};
use crate::models::user::User;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool, RepoError>;

    async fn member_ids(&self, chat_id: &str) -> Result<Vec<String>, RepoError>;

    /// Every chat the user belongs to.
    async fn user_chats(&self, user_id: &str) -> Result<Vec<Chat>, RepoError>;

    async fn user(&self, user_id: &str) -> Result<Option<User>, RepoError>;

    /// Persist the online flag and stamp `last_seen_at`.
    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), RepoError>;

    async fn create_message(&self, message: NewMessage) -> Result<Message, RepoError>;

    async fn message(&self, message_id: i64) -> Result<Option<Message>, RepoError>;

    /// Mark every message in the chat not sent by `user_id` as read and
    /// record the read time on the membership. Returns that time.
    async fn mark_as_read(&self, chat_id: &str, user_id: &str) -> Result<DateTime<Utc>, RepoError>;

    async fn edit_message(&self, message_id: i64, content: &str) -> Result<Message, RepoError>;

    /// Clear the content and attachment, set the deleted flag.
    async fn soft_delete_message(&self, message_id: i64) -> Result<Message, RepoError>;

    /// Idempotent.
    async fn add_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<(), RepoError>;

    async fn remove_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<(), RepoError>;

    /// Idempotent.
    async fn pin_message(&self, chat_id: &str, message_id: i64, pinned_by: &str) -> Result<(), RepoError>;

    async fn unpin_message(&self, chat_id: &str, message_id: i64) -> Result<(), RepoError>;
}

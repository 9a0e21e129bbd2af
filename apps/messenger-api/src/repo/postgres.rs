use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::OptionalExtension;

use super::ChatRepository;
use crate::db::pool::DbPool;
use crate::db::schema::{chat_members, chats, messages, pinned_messages, reactions, users};
use crate::error::RepoError;
use crate::models::chat::Chat;
use crate::models::message::{Message, NewMessage};
use crate::models::reaction::{NewPin, NewReaction};
use crate::models::user::User;

/// `ChatRepository` backed by PostgreSQL through diesel-async.
#[derive(Clone)]
pub struct PgRepository {
    pool: DbPool,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRepository for PgRepository {
    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool, RepoError> {
        let mut conn = self.pool.get().await?;
        let found: Option<String> = diesel_async::RunQueryDsl::get_result(
            chat_members::table
                .filter(chat_members::chat_id.eq(chat_id))
                .filter(chat_members::user_id.eq(user_id))
                .select(chat_members::user_id),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(found.is_some())
    }

    async fn member_ids(&self, chat_id: &str) -> Result<Vec<String>, RepoError> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = diesel_async::RunQueryDsl::load(
            chat_members::table
                .filter(chat_members::chat_id.eq(chat_id))
                .select(chat_members::user_id),
            &mut conn,
        )
        .await?;
        Ok(ids)
    }

    async fn user_chats(&self, user_id: &str) -> Result<Vec<Chat>, RepoError> {
        let mut conn = self.pool.get().await?;
        let chats: Vec<Chat> = diesel_async::RunQueryDsl::load(
            chats::table
                .inner_join(chat_members::table)
                .filter(chat_members::user_id.eq(user_id))
                .order(chats::id.asc())
                .select(Chat::as_select()),
            &mut conn,
        )
        .await?;
        Ok(chats)
    }

    async fn user(&self, user_id: &str) -> Result<Option<User>, RepoError> {
        let mut conn = self.pool.get().await?;
        let user: Option<User> = diesel_async::RunQueryDsl::get_result(
            users::table.find(user_id).select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(user)
    }

    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::update(users::table.find(user_id)).set((
                users::is_online.eq(online),
                users::last_seen_at.eq(Some(Utc::now())),
            )),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, RepoError> {
        let mut conn = self.pool.get().await?;
        let message: Message = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(messages::table)
                .values(&message)
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await?;
        Ok(message)
    }

    async fn message(&self, message_id: i64) -> Result<Option<Message>, RepoError> {
        let mut conn = self.pool.get().await?;
        let message: Option<Message> = diesel_async::RunQueryDsl::get_result(
            messages::table.find(message_id).select(Message::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(message)
    }

    async fn mark_as_read(&self, chat_id: &str, user_id: &str) -> Result<DateTime<Utc>, RepoError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();

        diesel_async::RunQueryDsl::execute(
            diesel::update(
                messages::table
                    .filter(messages::chat_id.eq(chat_id))
                    .filter(messages::sender_id.ne(user_id))
                    .filter(messages::is_read.eq(false)),
            )
            .set(messages::is_read.eq(true)),
            &mut conn,
        )
        .await?;

        diesel_async::RunQueryDsl::execute(
            diesel::update(
                chat_members::table
                    .filter(chat_members::chat_id.eq(chat_id))
                    .filter(chat_members::user_id.eq(user_id)),
            )
            .set(chat_members::last_read_at.eq(Some(now))),
            &mut conn,
        )
        .await?;

        Ok(now)
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> Result<Message, RepoError> {
        let mut conn = self.pool.get().await?;
        let message: Message = diesel_async::RunQueryDsl::get_result(
            diesel::update(messages::table.find(message_id))
                .set((
                    messages::content.eq(Some(content)),
                    messages::edited_at.eq(Some(Utc::now())),
                ))
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await?;
        Ok(message)
    }

    async fn soft_delete_message(&self, message_id: i64) -> Result<Message, RepoError> {
        let mut conn = self.pool.get().await?;
        let message: Message = diesel_async::RunQueryDsl::get_result(
            diesel::update(messages::table.find(message_id))
                .set((
                    messages::content.eq(None::<String>),
                    messages::file_url.eq(None::<String>),
                    messages::file_name.eq(None::<String>),
                    messages::file_type.eq(None::<String>),
                    messages::is_deleted.eq(true),
                ))
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await?;
        Ok(message)
    }

    async fn add_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(reactions::table)
                .values(NewReaction {
                    message_id,
                    user_id,
                    emoji,
                    created_at: Utc::now(),
                })
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::delete(
                reactions::table
                    .filter(reactions::message_id.eq(message_id))
                    .filter(reactions::user_id.eq(user_id))
                    .filter(reactions::emoji.eq(emoji)),
            ),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn pin_message(&self, chat_id: &str, message_id: i64, pinned_by: &str) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(pinned_messages::table)
                .values(NewPin {
                    chat_id,
                    message_id,
                    pinned_by,
                    pinned_at: Utc::now(),
                })
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn unpin_message(&self, chat_id: &str, message_id: i64) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::delete(
                pinned_messages::table
                    .filter(pinned_messages::chat_id.eq(chat_id))
                    .filter(pinned_messages::message_id.eq(message_id)),
            ),
            &mut conn,
        )
        .await?;
        Ok(())
    }
}

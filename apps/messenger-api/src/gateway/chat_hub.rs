//! Chat hub: connection registry, presence, and the inbound event dispatcher.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use messenger_common::SnowflakeGenerator;
use serde_json::json;
use tokio::time;

use super::connection::Connection;
use super::events::{
    encode, parse_client_event, ClientEvent, MemberPayload, MessageRef, MessageView, PinPayload, PresencePayload,
    ReactionPayload, ReadPayload, ServerEvent, TypingPayload,
};
use super::registry::{Admission, ConnectionRegistry, Removal};
use super::{Hub, HubSettings, CLOSE_GOING_AWAY, CLOSE_TRY_AGAIN_LATER};
use crate::error::{HubError, RepoError};
use crate::models::chat::Chat;
use crate::models::message::{Message, NewMessage, ReplyPreview};
use crate::models::user::UserSummary;
use crate::push::{message_preview, PushNotifier};
use crate::repo::ChatRepository;

const MAX_EMOJI_CHARS: usize = 32;

pub struct ChatHub {
    registry: ConnectionRegistry,
    repo: Arc<dyn ChatRepository>,
    push: Arc<dyn PushNotifier>,
    snowflake: SnowflakeGenerator,
    settings: HubSettings,
}

impl ChatHub {
    pub fn new(repo: Arc<dyn ChatRepository>, push: Arc<dyn PushNotifier>, settings: HubSettings) -> Self {
        Self {
            registry: ConnectionRegistry::new(settings.max_connections),
            repo,
            push,
            snowflake: SnowflakeGenerator::new(0),
            settings,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        self.registry.online_users()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Run a repository call under the per-event deadline.
    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, HubError>
    where
        F: Future<Output = Result<T, RepoError>>,
    {
        match time::timeout(self.settings.repo_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HubError::Timeout),
        }
    }

    /// Deliver `event` to every live connection of `recipients`, skipping
    /// `exclude`. Returns how many connections accepted the frame.
    fn fan_out<'a, I>(&self, recipients: I, event: &ServerEvent, exclude: Option<&str>) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let frame = match encode(event) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(?err, "failed to serialize chat event");
                return 0;
            }
        };

        let targets = self
            .registry
            .connections_for(recipients.into_iter().filter(|id| Some(*id) != exclude));
        targets.iter().filter(|conn| conn.send(frame.clone())).count()
    }

    async fn fan_out_to_chat(&self, chat_id: &str, event: &ServerEvent, exclude: Option<&str>) -> Result<usize, HubError> {
        let members = self.with_timeout(self.repo.member_ids(chat_id)).await?;
        Ok(self.fan_out(members.iter().map(String::as_str), event, exclude))
    }

    async fn ensure_member(&self, chat_id: &str, user_id: &str) -> Result<(), HubError> {
        if self.with_timeout(self.repo.is_member(chat_id, user_id)).await? {
            Ok(())
        } else {
            Err(HubError::NotMember)
        }
    }

    async fn load_message(&self, message_id: i64) -> Result<Message, HubError> {
        self.with_timeout(self.repo.message(message_id))
            .await?
            .ok_or(HubError::NotFound("message"))
    }

    /// Persist the presence flag and tell everyone sharing a chat with the
    /// user. Failures are logged; the connection is already admitted.
    async fn presence_changed(&self, user_id: &str, online: bool) {
        if let Err(err) = self.with_timeout(self.repo.set_online(user_id, online)).await {
            tracing::warn!(%err, user_id = %user_id, online, "failed to persist presence");
        }
        // Shutdown may have drained the registry and written `false` while
        // this write was in flight; the later `true` must not stick.
        if online && !self.registry.is_accepting() {
            if let Err(err) = self.with_timeout(self.repo.set_online(user_id, false)).await {
                tracing::warn!(%err, user_id = %user_id, "failed to persist offline state");
            }
            return;
        }

        let chats = match self.with_timeout(self.repo.user_chats(user_id)).await {
            Ok(chats) => chats,
            Err(err) => {
                tracing::warn!(%err, user_id = %user_id, "failed to load chats for presence broadcast");
                return;
            }
        };

        let mut recipients = HashSet::new();
        for chat in &chats {
            match self.with_timeout(self.repo.member_ids(&chat.id)).await {
                Ok(members) => recipients.extend(members),
                Err(err) => tracing::warn!(%err, chat_id = %chat.id, "failed to load members for presence"),
            }
        }

        let payload = PresencePayload {
            user_id: user_id.to_string(),
        };
        let event = if online {
            ServerEvent::UserOnline(payload)
        } else {
            ServerEvent::UserOffline(payload)
        };
        let delivered = self.fan_out(recipients.iter().map(String::as_str), &event, Some(user_id));
        tracing::debug!(user_id = %user_id, online, delivered, "presence broadcast");
    }

    fn reply_error(&self, conn: &Connection, err: &HubError, event: Option<&str>) {
        if err.is_internal() {
            tracing::warn!(%err, ?event, conn_id = %conn.id(), user_id = %conn.user_id(), "chat event failed");
        } else {
            tracing::debug!(%err, ?event, conn_id = %conn.id(), "chat event rejected");
        }
        conn.send_event(&ServerEvent::error(err.to_string(), event));
    }

    async fn dispatch(&self, conn: &Connection, event: ClientEvent) -> Result<(), HubError> {
        let user_id = conn.user_id();

        match event {
            ClientEvent::NewMessage {
                chat_id,
                content,
                file_url,
                file_name,
                file_type,
                reply_to_id,
            } => {
                let chat_id = required(chat_id, "chat_id")?;
                let content = trimmed(content);
                let file_url = trimmed(file_url);
                if content.is_none() && file_url.is_none() {
                    return Err(HubError::validation("content or file is required"));
                }
                if let Some(text) = &content {
                    self.check_length(text)?;
                }

                self.ensure_member(&chat_id, user_id).await?;

                let reply_to = match reply_to_id {
                    Some(reply_id) => {
                        let target = self
                            .with_timeout(self.repo.message(reply_id))
                            .await?
                            .filter(|m| m.chat_id == chat_id)
                            .ok_or(HubError::NotFound("reply target"))?;
                        Some(ReplyPreview::from(&target))
                    }
                    None => None,
                };

                let message = self
                    .with_timeout(self.repo.create_message(NewMessage {
                        id: self.snowflake.generate(),
                        chat_id: chat_id.clone(),
                        sender_id: user_id.to_string(),
                        content,
                        file_url,
                        file_name: trimmed(file_name),
                        file_type: trimmed(file_type),
                        reply_to_id: reply_to.as_ref().map(|r| r.id),
                        created_at: Utc::now(),
                    }))
                    .await?;

                let sender = match self.with_timeout(self.repo.user(user_id)).await {
                    Ok(user) => user.as_ref().map(UserSummary::from),
                    Err(err) => {
                        tracing::warn!(%err, user_id = %user_id, "sender lookup failed");
                        None
                    }
                };

                let members = self.with_timeout(self.repo.member_ids(&chat_id)).await?;
                let view = MessageView {
                    message,
                    sender,
                    reply_to,
                };
                let event = ServerEvent::NewMessage(view.clone());
                let delivered = self.fan_out(members.iter().map(String::as_str), &event, None);
                tracing::debug!(chat_id = %chat_id, user_id = %user_id, delivered, "new_message fanned out");
                self.push_new_message(&members, &view);
            }

            ClientEvent::Typing { chat_id, is_typing } => {
                let chat_id = required(chat_id, "chat_id")?;
                self.ensure_member(&chat_id, user_id).await?;
                let event = ServerEvent::Typing(TypingPayload {
                    chat_id: chat_id.clone(),
                    user_id: user_id.to_string(),
                    is_typing,
                });
                self.fan_out_to_chat(&chat_id, &event, Some(user_id)).await?;
            }

            ClientEvent::MessageRead { chat_id } => {
                let chat_id = required(chat_id, "chat_id")?;
                self.ensure_member(&chat_id, user_id).await?;
                let read_at = self.with_timeout(self.repo.mark_as_read(&chat_id, user_id)).await?;
                let event = ServerEvent::MessageRead(ReadPayload {
                    chat_id: chat_id.clone(),
                    user_id: user_id.to_string(),
                    read_at,
                });
                self.fan_out_to_chat(&chat_id, &event, Some(user_id)).await?;
            }

            ClientEvent::MessageEdited { message_id, content } => {
                let message_id = required_id(message_id)?;
                let content = trimmed(content).ok_or_else(|| HubError::validation("content is required"))?;
                self.check_length(&content)?;

                let message = self.load_message(message_id).await?;
                if message.sender_id != user_id {
                    return Err(HubError::NotAuthor);
                }
                if message.is_deleted {
                    return Err(HubError::validation("cannot edit a deleted message"));
                }
                self.ensure_member(&message.chat_id, user_id).await?;

                let updated = self.with_timeout(self.repo.edit_message(message_id, &content)).await?;
                let chat_id = updated.chat_id.clone();
                self.fan_out_to_chat(&chat_id, &ServerEvent::MessageEdited(updated), None)
                    .await?;
            }

            ClientEvent::MessageDeleted { message_id } => {
                let message_id = required_id(message_id)?;
                let message = self.load_message(message_id).await?;
                if message.sender_id != user_id {
                    return Err(HubError::NotAuthor);
                }
                self.ensure_member(&message.chat_id, user_id).await?;

                let deleted = self.with_timeout(self.repo.soft_delete_message(message_id)).await?;
                let event = ServerEvent::MessageDeleted(MessageRef {
                    message_id,
                    chat_id: deleted.chat_id.clone(),
                });
                self.fan_out_to_chat(&deleted.chat_id, &event, None).await?;
            }

            ClientEvent::ReactionAdded { message_id, emoji } => {
                let payload = self.reaction(user_id, message_id, emoji).await?;
                self.with_timeout(self.repo.add_reaction(payload.message_id, user_id, &payload.emoji))
                    .await?;
                let chat_id = payload.chat_id.clone();
                self.fan_out_to_chat(&chat_id, &ServerEvent::ReactionAdded(payload), None)
                    .await?;
            }

            ClientEvent::ReactionRemoved { message_id, emoji } => {
                let payload = self.reaction(user_id, message_id, emoji).await?;
                self.with_timeout(self.repo.remove_reaction(payload.message_id, user_id, &payload.emoji))
                    .await?;
                let chat_id = payload.chat_id.clone();
                self.fan_out_to_chat(&chat_id, &ServerEvent::ReactionRemoved(payload), None)
                    .await?;
            }

            ClientEvent::MessagePinned { chat_id, message_id } => {
                let payload = self.pin(user_id, chat_id, message_id).await?;
                self.with_timeout(self.repo.pin_message(&payload.chat_id, payload.message_id, user_id))
                    .await?;
                let chat_id = payload.chat_id.clone();
                self.fan_out_to_chat(&chat_id, &ServerEvent::MessagePinned(payload), None)
                    .await?;
            }

            ClientEvent::MessageUnpinned { chat_id, message_id } => {
                let payload = self.pin(user_id, chat_id, message_id).await?;
                self.with_timeout(self.repo.unpin_message(&payload.chat_id, payload.message_id))
                    .await?;
                let chat_id = payload.chat_id.clone();
                self.fan_out_to_chat(&chat_id, &ServerEvent::MessageUnpinned(payload), None)
                    .await?;
            }
        }

        Ok(())
    }

    fn check_length(&self, text: &str) -> Result<(), HubError> {
        let max = self.settings.max_message_length;
        if text.chars().count() > max {
            return Err(HubError::validation(format!("message exceeds {max} characters")));
        }
        Ok(())
    }

    /// Validate a reaction change and resolve the message's chat.
    async fn reaction(
        &self,
        user_id: &str,
        message_id: Option<i64>,
        emoji: Option<String>,
    ) -> Result<ReactionPayload, HubError> {
        let message_id = required_id(message_id)?;
        let emoji = trimmed(emoji).ok_or_else(|| HubError::validation("emoji is required"))?;
        if emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(HubError::validation(format!(
                "emoji must be at most {MAX_EMOJI_CHARS} characters"
            )));
        }

        let message = self.load_message(message_id).await?;
        if message.is_deleted {
            return Err(HubError::NotFound("message"));
        }
        self.ensure_member(&message.chat_id, user_id).await?;

        Ok(ReactionPayload {
            message_id,
            chat_id: message.chat_id,
            user_id: user_id.to_string(),
            emoji,
        })
    }

    /// Validate a pin change: membership, and the message must live in the chat.
    async fn pin(&self, user_id: &str, chat_id: Option<String>, message_id: Option<i64>) -> Result<PinPayload, HubError> {
        let chat_id = required(chat_id, "chat_id")?;
        let message_id = required_id(message_id)?;
        self.ensure_member(&chat_id, user_id).await?;

        let message = self.load_message(message_id).await?;
        if message.chat_id != chat_id {
            return Err(HubError::NotFound("message"));
        }

        Ok(PinPayload {
            chat_id,
            message_id,
            user_id: user_id.to_string(),
        })
    }

    /// Fire-and-forget push to every member except the sender.
    fn push_new_message(&self, members: &[String], view: &MessageView) {
        let message = &view.message;
        let title = view
            .sender
            .as_ref()
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| "New message".to_string());
        let body = message_preview(message.content.as_deref(), message.file_name.as_deref());
        let data = json!({
            "chat_id": message.chat_id,
            "message_id": message.id.to_string(),
        });

        for member in members.iter().filter(|m| **m != message.sender_id) {
            let push = self.push.clone();
            let member = member.clone();
            let title = title.clone();
            let body = body.clone();
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(err) = push.notify(&member, &title, &body, data).await {
                    tracing::debug!(%err, user_id = %member, "push notification failed");
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Outbound-only events raised by the REST layer after its own writes
    // -----------------------------------------------------------------------

    pub fn notify_chat_created(&self, chat: &Chat, member_ids: &[String]) -> usize {
        self.fan_out(
            member_ids.iter().map(String::as_str),
            &ServerEvent::ChatCreated(chat.clone()),
            None,
        )
    }

    pub async fn notify_chat_updated(&self, chat: &Chat) -> Result<usize, HubError> {
        self.fan_out_to_chat(&chat.id, &ServerEvent::ChatUpdated(chat.clone()), None)
            .await
    }

    /// Announce a new member to the chat, the new member included.
    pub async fn notify_member_added(&self, chat_id: &str, user_id: &str) -> Result<usize, HubError> {
        self.notify_membership(chat_id, user_id, true).await
    }

    /// Announce a departure. The removed member is told too so their clients
    /// can drop the chat.
    pub async fn notify_member_removed(&self, chat_id: &str, user_id: &str) -> Result<usize, HubError> {
        self.notify_membership(chat_id, user_id, false).await
    }

    async fn notify_membership(&self, chat_id: &str, user_id: &str, added: bool) -> Result<usize, HubError> {
        let mut recipients = self.with_timeout(self.repo.member_ids(chat_id)).await?;
        if !recipients.iter().any(|m| m == user_id) {
            recipients.push(user_id.to_string());
        }
        let payload = MemberPayload {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
        };
        let event = if added {
            ServerEvent::MemberAdded(payload)
        } else {
            ServerEvent::MemberRemoved(payload)
        };
        Ok(self.fan_out(recipients.iter().map(String::as_str), &event, None))
    }

    /// Stop admitting, close every connection, and wait for their pumps.
    pub async fn shutdown(&self) {
        let conns = self.registry.drain();
        tracing::info!(connections = conns.len(), "chat hub shutting down");

        let users: HashSet<&str> = conns.iter().map(|c| c.user_id()).collect();
        for user_id in users {
            if let Err(err) = self.with_timeout(self.repo.set_online(user_id, false)).await {
                tracing::warn!(%err, user_id = %user_id, "failed to persist offline state");
            }
        }

        for conn in &conns {
            conn.close_with(CLOSE_GOING_AWAY, "server shutting down");
        }
        let pumps = join_all(conns.iter().map(|c| c.wait_done()));
        if time::timeout(self.settings.write_wait * 2, pumps).await.is_err() {
            tracing::warn!("timed out waiting for chat connections to finish");
        }
    }
}

#[async_trait]
impl Hub for ChatHub {
    fn settings(&self) -> &HubSettings {
        &self.settings
    }

    async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        match self.registry.insert(conn.clone()) {
            Ok(Admission::FirstForUser) => {
                self.presence_changed(conn.user_id(), true).await;
                Ok(())
            }
            Ok(Admission::Additional) => Ok(()),
            Err(err) => {
                let code = match err {
                    HubError::ShuttingDown => CLOSE_GOING_AWAY,
                    _ => CLOSE_TRY_AGAIN_LATER,
                };
                tracing::warn!(%err, user_id = %conn.user_id(), "chat connection rejected");
                conn.close_with(code, &err.to_string());
                Err(err)
            }
        }
    }

    async fn unregister(&self, conn: &Arc<Connection>) {
        if self.registry.remove(conn) == Removal::LastForUser {
            self.presence_changed(conn.user_id(), false).await;
        }
    }

    async fn handle_frame(&self, conn: &Arc<Connection>, text: &str) {
        let event = match parse_client_event(text) {
            Ok(event) => event,
            Err(err) => {
                self.reply_error(conn, &err, None);
                return;
            }
        };

        let name = event.name();
        if let Err(err) = self.dispatch(conn, event).await {
            self.reply_error(conn, &err, Some(name));
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(value: Option<String>, field: &str) -> Result<String, HubError> {
    trimmed(value).ok_or_else(|| HubError::validation(format!("{field} is required")))
}

fn required_id(value: Option<i64>) -> Result<i64, HubError> {
    value.ok_or_else(|| HubError::validation("message_id is required"))
}

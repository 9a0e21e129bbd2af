use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::ChatRepository;
use crate::error::RepoError;
use crate::models::chat::Chat;
use crate::models::message::{Message, NewMessage};
use crate::models::user::User;

#[derive(Default)]
struct Data {
    users: HashMap<String, User>,
    chats: HashMap<String, Chat>,
    /// chat_id → (user_id → last_read_at)
    members: HashMap<String, BTreeMap<String, Option<DateTime<Utc>>>>,
    messages: HashMap<i64, Message>,
    reactions: HashSet<(i64, String, String)>,
    pins: HashSet<(String, i64)>,
}

/// `ChatRepository` over in-process maps.
#[derive(Default)]
pub struct MemoryRepository {
    data: Mutex<Data>,
    /// Artificial latency applied to every call.
    delay: Mutex<Option<Duration>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, id: &str, display_name: &str) {
        let now = Utc::now();
        self.data.lock().users.insert(
            id.to_string(),
            User {
                id: id.to_string(),
                display_name: display_name.to_string(),
                avatar_url: None,
                is_online: false,
                last_seen_at: None,
                created_at: now,
            },
        );
    }

    /// Create (or replace) a chat with the given members.
    pub fn add_chat(&self, id: &str, name: Option<&str>, member_ids: &[&str]) -> Chat {
        let now = Utc::now();
        let chat = Chat {
            id: id.to_string(),
            name: name.map(str::to_string),
            is_group: member_ids.len() > 2,
            created_by: member_ids.first().map(|s| s.to_string()).unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        let mut data = self.data.lock();
        data.chats.insert(id.to_string(), chat.clone());
        data.members.insert(
            id.to_string(),
            member_ids.iter().map(|m| (m.to_string(), None)).collect(),
        );
        chat
    }

    pub fn add_member(&self, chat_id: &str, user_id: &str) {
        self.data
            .lock()
            .members
            .entry(chat_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_insert(None);
    }

    pub fn remove_member(&self, chat_id: &str, user_id: &str) {
        if let Some(members) = self.data.lock().members.get_mut(chat_id) {
            members.remove(user_id);
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.data.lock().users.get(user_id).is_some_and(|u| u.is_online)
    }

    pub fn has_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> bool {
        self.data
            .lock()
            .reactions
            .contains(&(message_id, user_id.to_string(), emoji.to_string()))
    }

    pub fn is_pinned(&self, chat_id: &str, message_id: i64) -> bool {
        self.data.lock().pins.contains(&(chat_id.to_string(), message_id))
    }

    pub fn last_read_at(&self, chat_id: &str, user_id: &str) -> Option<DateTime<Utc>> {
        self.data
            .lock()
            .members
            .get(chat_id)
            .and_then(|m| m.get(user_id).copied().flatten())
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    async fn simulate_latency(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ChatRepository for MemoryRepository {
    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool, RepoError> {
        self.simulate_latency().await;
        Ok(self
            .data
            .lock()
            .members
            .get(chat_id)
            .is_some_and(|m| m.contains_key(user_id)))
    }

    async fn member_ids(&self, chat_id: &str) -> Result<Vec<String>, RepoError> {
        self.simulate_latency().await;
        Ok(self
            .data
            .lock()
            .members
            .get(chat_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn user_chats(&self, user_id: &str) -> Result<Vec<Chat>, RepoError> {
        self.simulate_latency().await;
        let data = self.data.lock();
        let mut chats: Vec<Chat> = data
            .members
            .iter()
            .filter(|(_, members)| members.contains_key(user_id))
            .filter_map(|(chat_id, _)| data.chats.get(chat_id).cloned())
            .collect();
        chats.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chats)
    }

    async fn user(&self, user_id: &str) -> Result<Option<User>, RepoError> {
        self.simulate_latency().await;
        Ok(self.data.lock().users.get(user_id).cloned())
    }

    async fn set_online(&self, user_id: &str, online: bool) -> Result<(), RepoError> {
        self.simulate_latency().await;
        if let Some(user) = self.data.lock().users.get_mut(user_id) {
            user.is_online = online;
            user.last_seen_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, RepoError> {
        self.simulate_latency().await;
        let message = message.into_message();
        self.data.lock().messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn message(&self, message_id: i64) -> Result<Option<Message>, RepoError> {
        self.simulate_latency().await;
        Ok(self.data.lock().messages.get(&message_id).cloned())
    }

    async fn mark_as_read(&self, chat_id: &str, user_id: &str) -> Result<DateTime<Utc>, RepoError> {
        self.simulate_latency().await;
        let now = Utc::now();
        let mut data = self.data.lock();
        for message in data.messages.values_mut() {
            if message.chat_id == chat_id && message.sender_id != user_id {
                message.is_read = true;
            }
        }
        if let Some(last_read) = data.members.get_mut(chat_id).and_then(|m| m.get_mut(user_id)) {
            *last_read = Some(now);
        }
        Ok(now)
    }

    async fn edit_message(&self, message_id: i64, content: &str) -> Result<Message, RepoError> {
        self.simulate_latency().await;
        let mut data = self.data.lock();
        let message = data.messages.get_mut(&message_id).ok_or(RepoError::NotFound)?;
        message.content = Some(content.to_string());
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn soft_delete_message(&self, message_id: i64) -> Result<Message, RepoError> {
        self.simulate_latency().await;
        let mut data = self.data.lock();
        let message = data.messages.get_mut(&message_id).ok_or(RepoError::NotFound)?;
        message.content = None;
        message.file_url = None;
        message.file_name = None;
        message.file_type = None;
        message.is_deleted = true;
        Ok(message.clone())
    }

    async fn add_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<(), RepoError> {
        self.simulate_latency().await;
        self.data
            .lock()
            .reactions
            .insert((message_id, user_id.to_string(), emoji.to_string()));
        Ok(())
    }

    async fn remove_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<(), RepoError> {
        self.simulate_latency().await;
        self.data
            .lock()
            .reactions
            .remove(&(message_id, user_id.to_string(), emoji.to_string()));
        Ok(())
    }

    async fn pin_message(&self, chat_id: &str, message_id: i64, _pinned_by: &str) -> Result<(), RepoError> {
        self.simulate_latency().await;
        self.data.lock().pins.insert((chat_id.to_string(), message_id));
        Ok(())
    }

    async fn unpin_message(&self, chat_id: &str, message_id: i64) -> Result<(), RepoError> {
        self.simulate_latency().await;
        self.data.lock().pins.remove(&(chat_id.to_string(), message_id));
        Ok(())
    }
}

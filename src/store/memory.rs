//! In-memory `DataStore` for tests and local development.
//!
//! Enforces the same uniqueness rule as the SQLite schema: at most one
//! reaction per (message, user, emoji), reported as `StoreError::Conflict`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{AuthorInfo, DataStore, MessageRecord, ReactionRecord, StoreError, UserInfo};

#[derive(Default)]
struct Inner {
    /// user_id -> username
    users: HashMap<String, String>,
    /// channel_id -> bunch_id
    channels: HashMap<String, String>,
    /// (bunch_id, user_id) -> (member_id, role, joined_at)
    members: HashMap<(String, String), (String, String, String)>,
    /// message_id -> record
    messages: HashMap<String, MessageRecord>,
    /// (message_id, user_id, emoji) -> record
    reactions: HashMap<(String, String, String), ReactionRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: &str, username: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(user_id.into(), username.into());
    }

    pub fn add_channel(&self, bunch_id: &str, channel_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.insert(channel_id.into(), bunch_id.into());
    }

    pub fn add_member(&self, bunch_id: &str, user_id: &str, role: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.members.insert(
            (bunch_id.into(), user_id.into()),
            (
                Uuid::new_v4().to_string(),
                role.into(),
                Utc::now().to_rfc3339(),
            ),
        );
    }

    /// Register a message directly, bypassing membership checks. Test setup.
    pub fn seed_message(&self, message_id: &str, bunch_id: &str, channel_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels.entry(channel_id.into()).or_insert_with(|| bunch_id.into());
        inner.messages.insert(
            message_id.into(),
            MessageRecord {
                id: message_id.into(),
                channel: channel_id.into(),
                author: AuthorInfo {
                    id: Uuid::new_v4().to_string(),
                    bunch: bunch_id.into(),
                    user: UserInfo {
                        id: "seed".into(),
                        username: "seed".into(),
                    },
                    role: "member".into(),
                    joined_at: Utc::now().to_rfc3339(),
                },
                content: String::new(),
                created_at: Utc::now().to_rfc3339(),
                updated_at: Utc::now().to_rfc3339(),
                edit_count: 0,
                deleted: false,
            },
        );
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn reaction_count(&self) -> usize {
        self.inner.lock().unwrap().reactions.len()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn is_member(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        if let Some(cid) = channel_id {
            if inner.channels.get(cid).map(String::as_str) != Some(bunch_id) {
                return Ok(false);
            }
        }
        Ok(inner
            .members
            .contains_key(&(bunch_id.to_string(), user_id.to_string())))
    }

    async fn create_message(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.channels.get(channel_id).map(String::as_str) != Some(bunch_id) {
            return Err(StoreError::NotFound(format!(
                "channel {channel_id} not found in bunch {bunch_id}"
            )));
        }
        let (member_id, role, joined_at) = inner
            .members
            .get(&(bunch_id.to_string(), user_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("no membership for user {user_id} in bunch {bunch_id}"))
            })?;
        let username = inner
            .users
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string());

        let now = Utc::now().to_rfc3339();
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            channel: channel_id.to_string(),
            author: AuthorInfo {
                id: member_id,
                bunch: bunch_id.to_string(),
                user: UserInfo {
                    id: user_id.to_string(),
                    username,
                },
                role,
                joined_at,
            },
            content: content.to_string(),
            created_at: now.clone(),
            updated_at: now,
            edit_count: 0,
            deleted: false,
        };
        inner.messages.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn create_reaction(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message_bunch = inner
            .messages
            .get(message_id)
            .map(|m| m.author.bunch.clone());
        if message_bunch.as_deref() != Some(bunch_id) {
            return Err(StoreError::NotFound(format!("message {message_id} not found")));
        }

        let key = (
            message_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        );
        if inner.reactions.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "duplicate reaction {emoji} on message {message_id}"
            )));
        }

        let username = inner
            .users
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string());
        let record = ReactionRecord {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            user: UserInfo {
                id: user_id.to_string(),
                username,
            },
            emoji: emoji.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        inner.reactions.insert(key, record.clone());
        Ok(record)
    }

    async fn find_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .reactions
            .get(&(
                message_id.to_string(),
                user_id.to_string(),
                emoji.to_string(),
            ))
            .cloned())
    }

    async fn delete_reaction(
        &self,
        user_id: &str,
        _bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.reactions.remove(&(
            message_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        )))
    }
}

//! Collaborator interfaces for persistence and membership checks.
//!
//! The gateway itself never owns message or reaction storage; it talks to a
//! `DataStore` that must report unique-constraint violations distinctly from
//! generic failures (the reaction engine depends on that distinction).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a `DataStore` implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Referenced bunch/channel/message/member does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write (duplicate reaction key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend itself failed or is unreachable.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A persisted chat message, shaped for the `chat.message` broadcast payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub channel: String,
    pub author: AuthorInfo,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
    pub edit_count: u32,
    pub deleted: bool,
}

/// The author of a message: a membership record, not a bare user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub id: String,
    pub bunch: String,
    pub user: UserInfo,
    pub role: String,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
}

/// A persisted emoji reaction, shaped for reaction broadcast payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub id: String,
    pub message_id: String,
    pub user: UserInfo,
    pub emoji: String,
    pub created_at: String,
}

/// Persistence and membership operations the gateway delegates to.
///
/// Implementations provide their own consistency guarantees; the gateway
/// only assumes that creates are atomic and that duplicate reaction keys
/// come back as `StoreError::Conflict`.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Is this user a member of the bunch (and, when given, the channel)?
    async fn is_member(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Persist a message authored by the user's membership in the bunch.
    async fn create_message(
        &self,
        user_id: &str,
        bunch_id: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageRecord, StoreError>;

    /// Persist a reaction. Duplicate (message, user, emoji) keys must come
    /// back as `StoreError::Conflict`.
    async fn create_reaction(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionRecord, StoreError>;

    /// Look up an existing reaction by its (message, user, emoji) key.
    async fn find_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError>;

    /// Delete a reaction by key, returning the deleted row.
    async fn delete_reaction(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>, StoreError>;
}

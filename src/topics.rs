//! Topic directory: (bunch, channel) -> subscriber sessions, plus fanout.
//!
//! Subscribe authorizes against the membership oracle before touching any
//! state. Publish is fire-and-forget: one delivery attempt per subscriber,
//! and a dead or slow subscriber never blocks the rest. The REST layer
//! calls `publish` directly for writes it performs outside a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::DashMap;

use crate::store::{DataStore, StoreError};
use crate::ws::frames::ServerFrame;
use crate::ws::ConnectionSender;

/// Process-unique id for one live session. Client-supplied connection ids
/// can collide across users; this cannot.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Pub/sub routing key: a channel within a bunch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub bunch_id: String,
    pub channel_id: String,
}

impl TopicKey {
    pub fn new(bunch_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            bunch_id: bunch_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chat_{}_{}", self.bunch_id, self.channel_id)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Re-subscribing is a no-op, surfaced for logging but not a failure.
    AlreadySubscribed,
    AccessDenied,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    NotSubscribed,
}

/// Topic -> subscriber set. Internally synchronized; shared via `Arc`.
#[derive(Default)]
pub struct TopicDirectory {
    topics: DashMap<TopicKey, HashMap<SessionId, ConnectionSender>>,
}

impl TopicDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a topic after the membership oracle clears the user.
    /// Nothing changes on denial.
    pub async fn subscribe(
        &self,
        store: &dyn DataStore,
        user_id: &str,
        session: SessionId,
        tx: ConnectionSender,
        topic: &TopicKey,
    ) -> Result<SubscribeOutcome, StoreError> {
        let is_member = store
            .is_member(user_id, &topic.bunch_id, Some(&topic.channel_id))
            .await?;
        if !is_member {
            return Ok(SubscribeOutcome::AccessDenied);
        }

        let mut subscribers = self.topics.entry(topic.clone()).or_default();
        if subscribers.contains_key(&session) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        subscribers.insert(session, tx);
        Ok(SubscribeOutcome::Subscribed)
    }

    pub fn unsubscribe(&self, session: SessionId, topic: &TopicKey) -> UnsubscribeOutcome {
        let mut outcome = UnsubscribeOutcome::NotSubscribed;
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            if subscribers.remove(&session).is_some() {
                outcome = UnsubscribeOutcome::Unsubscribed;
            }
        }
        // Empty subscriber sets are garbage-collected rather than left behind.
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
        outcome
    }

    /// Remove a session from every topic it subscribed to. Called by whoever
    /// destroys the session; idempotent.
    pub fn unsubscribe_all<'a>(
        &self,
        session: SessionId,
        topics: impl IntoIterator<Item = &'a TopicKey>,
    ) {
        for topic in topics {
            self.unsubscribe(session, topic);
        }
    }

    /// Fan an event out to every current subscriber of the topic. Each gets
    /// exactly one delivery attempt; a full queue drops the frame for that
    /// subscriber, a closed queue unsubscribes it.
    pub fn publish(&self, topic: &TopicKey, frame: &ServerFrame) {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to encode frame");
                return;
            }
        };
        let msg = Message::Text(text.into());

        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|session, tx| match tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        topic = %topic,
                        session = session,
                        "Outbound queue full, dropping frame"
                    );
                    true
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    pub fn subscriber_count(&self, topic: &TopicKey) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

//! Reaction engine: add/remove/toggle with the one-row-per-key invariant.
//!
//! Toggle is check-then-act. Two concurrent toggles for the same key can
//! both observe "absent" and both attempt the insert; the store's uniqueness
//! constraint rejects the loser and the engine absorbs that `Conflict` as
//! already-exists instead of propagating a hard error.

use std::sync::Arc;

use crate::store::{DataStore, ReactionRecord, StoreError};

#[derive(Debug)]
pub enum AddOutcome {
    Added(ReactionRecord),
    /// The key already has a row. Not an error; the caller decides whether
    /// anything gets broadcast (nothing does).
    AlreadyExists,
    AccessDenied,
}

#[derive(Debug)]
pub enum RemoveOutcome {
    Removed(ReactionRecord),
    NotFound,
}

#[derive(Debug)]
pub enum ToggleOutcome {
    Added(ReactionRecord),
    /// Snapshot taken before deletion, for the broadcast payload.
    Removed(ReactionRecord),
    /// A concurrent toggle got there first; nothing to broadcast.
    Noop,
}

pub struct ReactionEngine {
    store: Arc<dyn DataStore>,
}

impl ReactionEngine {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn add(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<AddOutcome, StoreError> {
        if !self.store.is_member(user_id, bunch_id, None).await? {
            return Ok(AddOutcome::AccessDenied);
        }

        if self
            .store
            .find_reaction(user_id, message_id, emoji)
            .await?
            .is_some()
        {
            tracing::info!(
                user_id = %user_id,
                message_id = %message_id,
                emoji = %emoji,
                "Reaction already exists"
            );
            return Ok(AddOutcome::AlreadyExists);
        }

        match self
            .store
            .create_reaction(user_id, bunch_id, message_id, emoji)
            .await
        {
            Ok(record) => Ok(AddOutcome::Added(record)),
            // Lost the race against a concurrent add for the same key.
            Err(StoreError::Conflict(_)) => Ok(AddOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    pub async fn remove(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<RemoveOutcome, StoreError> {
        match self
            .store
            .delete_reaction(user_id, bunch_id, message_id, emoji)
            .await?
        {
            Some(record) => Ok(RemoveOutcome::Removed(record)),
            None => Ok(RemoveOutcome::NotFound),
        }
    }

    /// Add-if-absent-else-remove.
    pub async fn toggle(
        &self,
        user_id: &str,
        bunch_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<ToggleOutcome, StoreError> {
        let existing = self.store.find_reaction(user_id, message_id, emoji).await?;

        if existing.is_some() {
            match self
                .store
                .delete_reaction(user_id, bunch_id, message_id, emoji)
                .await?
            {
                Some(record) => Ok(ToggleOutcome::Removed(record)),
                None => Ok(ToggleOutcome::Noop),
            }
        } else {
            match self
                .store
                .create_reaction(user_id, bunch_id, message_id, emoji)
                .await
            {
                Ok(record) => Ok(ToggleOutcome::Added(record)),
                Err(StoreError::Conflict(_)) => Ok(ToggleOutcome::Noop),
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn engine() -> (ReactionEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.add_user("u1", "ada");
        store.add_channel("b1", "c1");
        store.add_member("b1", "u1", "member");
        store.seed_message("m1", "b1", "c1");
        (ReactionEngine::new(store.clone()), store)
    }

    #[tokio::test]
    async fn duplicate_add_reports_already_exists() {
        let (engine, store) = engine();

        let first = engine.add("u1", "b1", "m1", "🎉").await.unwrap();
        assert!(matches!(first, AddOutcome::Added(_)));

        let second = engine.add("u1", "b1", "m1", "🎉").await.unwrap();
        assert!(matches!(second, AddOutcome::AlreadyExists));
        assert_eq!(store.reaction_count(), 1);
    }

    #[tokio::test]
    async fn add_denied_for_non_member() {
        let (engine, store) = engine();

        let outcome = engine.add("outsider", "b1", "m1", "🎉").await.unwrap();
        assert!(matches!(outcome, AddOutcome::AccessDenied));
        assert_eq!(store.reaction_count(), 0);
    }

    #[tokio::test]
    async fn remove_missing_reaction_is_not_found() {
        let (engine, _store) = engine();

        let outcome = engine.remove("u1", "b1", "m1", "🎉").await.unwrap();
        assert!(matches!(outcome, RemoveOutcome::NotFound));
    }

    #[tokio::test]
    async fn toggle_is_its_own_inverse() {
        let (engine, store) = engine();

        let first = engine.toggle("u1", "b1", "m1", "🎉").await.unwrap();
        let added = match first {
            ToggleOutcome::Added(r) => r,
            other => panic!("expected Added, got {other:?}"),
        };
        assert_eq!(store.reaction_count(), 1);

        let second = engine.toggle("u1", "b1", "m1", "🎉").await.unwrap();
        match second {
            ToggleOutcome::Removed(snapshot) => {
                assert_eq!(snapshot.id, added.id);
                assert_eq!(snapshot.emoji, "🎉");
            }
            other => panic!("expected Removed, got {other:?}"),
        }
        assert_eq!(store.reaction_count(), 0);
    }

    /// Store whose lookups always miss, so the engine takes the insert path
    /// even when the row exists. Models the losing side of a concurrent
    /// toggle race.
    struct BlindStore(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl crate::store::DataStore for BlindStore {
        async fn is_member(
            &self,
            user_id: &str,
            bunch_id: &str,
            channel_id: Option<&str>,
        ) -> Result<bool, StoreError> {
            self.0.is_member(user_id, bunch_id, channel_id).await
        }

        async fn create_message(
            &self,
            user_id: &str,
            bunch_id: &str,
            channel_id: &str,
            content: &str,
        ) -> Result<crate::store::MessageRecord, StoreError> {
            self.0.create_message(user_id, bunch_id, channel_id, content).await
        }

        async fn create_reaction(
            &self,
            user_id: &str,
            bunch_id: &str,
            message_id: &str,
            emoji: &str,
        ) -> Result<ReactionRecord, StoreError> {
            self.0.create_reaction(user_id, bunch_id, message_id, emoji).await
        }

        async fn find_reaction(
            &self,
            _user_id: &str,
            _message_id: &str,
            _emoji: &str,
        ) -> Result<Option<ReactionRecord>, StoreError> {
            Ok(None)
        }

        async fn delete_reaction(
            &self,
            user_id: &str,
            bunch_id: &str,
            message_id: &str,
            emoji: &str,
        ) -> Result<Option<ReactionRecord>, StoreError> {
            self.0.delete_reaction(user_id, bunch_id, message_id, emoji).await
        }
    }

    #[tokio::test]
    async fn toggle_conflict_on_add_is_absorbed_as_noop() {
        let store = Arc::new(MemoryStore::new());
        store.add_user("u1", "ada");
        store.add_channel("b1", "c1");
        store.add_member("b1", "u1", "member");
        store.seed_message("m1", "b1", "c1");
        store.create_reaction("u1", "b1", "m1", "🎉").await.unwrap();

        // The engine's find misses, its insert hits the uniqueness
        // constraint, and the Conflict comes back as a quiet Noop.
        let engine = ReactionEngine::new(Arc::new(BlindStore(store.clone())));
        let outcome = engine.toggle("u1", "b1", "m1", "🎉").await.unwrap();
        assert!(matches!(outcome, ToggleOutcome::Noop));
        assert_eq!(store.reaction_count(), 1);
    }
}

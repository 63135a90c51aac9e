use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::reactions::ReactionEngine;
use crate::registry::ConnectionRegistry;
use crate::store::DataStore;
use crate::topics::TopicDirectory;

/// Shared application state passed to all handlers via axum State extractor.
/// Constructed once per process; everything mutable inside is internally
/// synchronized.
#[derive(Clone)]
pub struct AppState {
    /// Persistence and membership oracle.
    pub store: Arc<dyn DataStore>,
    /// Bearer-token oracle for connect-time auth.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Active WebSocket sessions per user.
    pub registry: Arc<ConnectionRegistry>,
    /// Topic -> subscriber sets, plus fanout.
    pub topics: Arc<TopicDirectory>,
    /// Reaction add/remove/toggle over the store.
    pub reactions: Arc<ReactionEngine>,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_size: usize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DataStore>,
        verifier: Arc<dyn TokenVerifier>,
        outbound_queue_size: usize,
    ) -> Self {
        Self {
            reactions: Arc::new(ReactionEngine::new(store.clone())),
            store,
            verifier,
            registry: Arc::new(ConnectionRegistry::new()),
            topics: Arc::new(TopicDirectory::new()),
            outbound_queue_size,
        }
    }
}

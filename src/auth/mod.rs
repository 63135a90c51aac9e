//! Token verification for WebSocket connects.
//!
//! The gateway treats auth as an oracle: hand it the bearer token from the
//! query string, get back a user identity or a rejection. The default
//! implementation validates HS256 JWTs; tests substitute a static verifier.

pub mod jwt;

use async_trait::async_trait;
use thiserror::Error;

/// The authenticated principal behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token invalid: {0}")]
    Invalid(String),

    #[error("verification backend error: {0}")]
    Backend(String),
}

/// Oracle deciding whether a bearer token names a real user.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Fixed-table verifier for tests: token string -> identity.
pub struct StaticVerifier {
    entries: Vec<(String, UserIdentity)>,
}

impl StaticVerifier {
    pub fn new(entries: Vec<(String, UserIdentity)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        self.entries
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, id)| id.clone())
            .ok_or_else(|| AuthError::Invalid("unknown token".into()))
    }
}

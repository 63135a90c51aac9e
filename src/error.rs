//! Error taxonomy for the gateway.
//!
//! Per-event failures are caught at the dispatch boundary and turned into
//! an error frame or a silent drop; only `Authentication` and unrecoverable
//! `Backend` errors terminate the connection. Display output is the
//! client-facing message carried by `error` frames.

use thiserror::Error;

use crate::store::StoreError;

/// Classified failure while handling a connection or one of its frames.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad or missing token; the connection closes without any frames.
    #[error("{0}")]
    Authentication(String),

    /// Not a member of the requested topic; connection stays open.
    #[error("{0}")]
    Authorization(String),

    /// Missing or malformed required fields on a known frame type.
    #[error("{0}")]
    Validation(String),

    /// Duplicate reaction or already-subscribed; a non-error outcome for
    /// the client but classified here for logging.
    #[error("{0}")]
    Conflict(String),

    /// The store or an oracle failed.
    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            // A missing bunch/channel/message means the client referenced
            // something that does not exist: a validation problem, not ours.
            StoreError::NotFound(m) => GatewayError::Validation(m),
            StoreError::Conflict(m) => GatewayError::Conflict(m),
            StoreError::Backend(m) => GatewayError::Backend(m),
        }
    }
}

impl GatewayError {
    /// Whether this error must close the connection rather than produce an
    /// error frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Authentication(_) | GatewayError::Backend(_)
        )
    }
}

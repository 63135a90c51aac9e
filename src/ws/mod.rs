pub mod actor;
pub mod frames;
pub mod handler;
pub mod protocol;

use tokio::sync::mpsc;

/// Sender half of a connection's bounded outbound queue. Anything holding a
/// clone can push frames to that client; the writer task owns the receiver.
pub type ConnectionSender = mpsc::Sender<axum::extract::ws::Message>;

//! Frame dispatch for an established connection.
//!
//! Every per-event failure is converted here into an error frame or a
//! silent drop; only an unreachable backend escalates to closing the
//! connection. The caller (the connection actor) owns the socket and acts
//! on the returned `Dispatch`.

use std::collections::HashSet;

use axum::extract::ws::Message;
use serde_json::Number;

use crate::auth::UserIdentity;
use crate::error::GatewayError;
use crate::reactions::{AddOutcome, RemoveOutcome, ToggleOutcome};
use crate::state::AppState;
use crate::store::StoreError;
use crate::topics::{SessionId, SubscribeOutcome, TopicKey, UnsubscribeOutcome};
use crate::ws::frames::{
    parse_client_frame, ClientFrame, InboundParse, ReactionAction, ServerFrame,
};
use crate::ws::ConnectionSender;

/// Close code for an unrecoverable backend failure mid-session.
pub const CLOSE_BACKEND_FAILURE: u16 = 4000;

/// Connection-scoped state the dispatcher reads and mutates.
pub struct SessionCtx {
    pub session_id: SessionId,
    pub user: UserIdentity,
    pub connection_id: String,
    pub is_keepalive: bool,
    pub tx: ConnectionSender,
    pub subscribed: HashSet<TopicKey>,
}

/// What the actor should do after a frame is handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Fatal { code: u16, reason: &'static str },
}

/// Handle one inbound text frame.
pub async fn handle_text_frame(text: &str, session: &mut SessionCtx, state: &AppState) -> Dispatch {
    let parsed = match parse_client_frame(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(user_id = %session.user.user_id, error = %e, "Malformed frame dropped");
            return Dispatch::Continue;
        }
    };

    let frame = match parsed {
        InboundParse::Frame(frame) => frame,
        InboundParse::UnknownType(frame_type) => {
            tracing::debug!(
                user_id = %session.user.user_id,
                frame_type = %frame_type,
                "Ignoring unknown frame type"
            );
            return Dispatch::Continue;
        }
        InboundParse::MissingType => {
            tracing::warn!(user_id = %session.user.user_id, "Frame without type dropped");
            return Dispatch::Continue;
        }
        InboundParse::BadFields { frame_type, error } => {
            // Reaction frames with bad fields are dropped quietly; everything
            // else gets an explicit validation error.
            if frame_type.starts_with("reaction") {
                tracing::warn!(
                    user_id = %session.user.user_id,
                    error = %error,
                    "Invalid reaction frame dropped"
                );
            } else {
                let err =
                    GatewayError::Validation(format!("Missing or invalid fields for '{frame_type}'"));
                tracing::warn!(user_id = %session.user.user_id, detail = %error, "Validation failure");
                send_error(&session.tx, &err.to_string());
            }
            return Dispatch::Continue;
        }
    };

    match frame {
        ClientFrame::Ping { timestamp } => handle_ping(timestamp, session, state),
        ClientFrame::Subscribe {
            bunch_id,
            channel_id,
        } => handle_subscribe(TopicKey::new(bunch_id, channel_id), session, state).await,
        ClientFrame::Unsubscribe {
            bunch_id,
            channel_id,
        } => handle_unsubscribe(TopicKey::new(bunch_id, channel_id), session, state),
        ClientFrame::NewMessage {
            bunch_id,
            channel_id,
            content,
        } => handle_new_message(TopicKey::new(bunch_id, channel_id), &content, session, state).await,
        ClientFrame::Reaction {
            message_id,
            emoji,
            bunch_id,
            channel_id,
            action,
        } => {
            handle_reaction(
                TopicKey::new(bunch_id, channel_id),
                &message_id,
                &emoji,
                action,
                session,
                state,
            )
            .await
        }
        ClientFrame::ReactionToggle {
            message_id,
            emoji,
            bunch_id,
            channel_id,
        } => {
            handle_reaction(
                TopicKey::new(bunch_id, channel_id),
                &message_id,
                &emoji,
                None,
                session,
                state,
            )
            .await
        }
    }
}

fn handle_ping(timestamp: Option<Number>, session: &SessionCtx, state: &AppState) -> Dispatch {
    state
        .registry
        .touch(&session.user.user_id, &session.connection_id);

    let server_time = ServerFrame::now_millis();
    let echoed = timestamp.unwrap_or_else(|| Number::from(server_time));
    send_frame(
        &session.tx,
        &ServerFrame::Pong {
            timestamp: echoed,
            server_time,
        },
    );
    Dispatch::Continue
}

async fn handle_subscribe(topic: TopicKey, session: &mut SessionCtx, state: &AppState) -> Dispatch {
    let outcome = state
        .topics
        .subscribe(
            state.store.as_ref(),
            &session.user.user_id,
            session.session_id,
            session.tx.clone(),
            &topic,
        )
        .await;

    match outcome {
        Ok(SubscribeOutcome::Subscribed) => {
            session.subscribed.insert(topic.clone());
            tracing::info!(user_id = %session.user.user_id, topic = %topic, "Subscribed");
        }
        Ok(SubscribeOutcome::AlreadySubscribed) => {
            tracing::warn!(user_id = %session.user.user_id, topic = %topic, "Already subscribed");
        }
        Ok(SubscribeOutcome::AccessDenied) => {
            let err = GatewayError::Authorization("Access denied to channel".into());
            send_error(&session.tx, &err.to_string());
            return Dispatch::Continue;
        }
        Err(e) => return store_failure(&session.tx, &session.user, e),
    }

    send_frame(
        &session.tx,
        &ServerFrame::Subscribed {
            bunch_id: topic.bunch_id,
            channel_id: topic.channel_id,
            message: "Subscribed to channel".into(),
        },
    );
    Dispatch::Continue
}

fn handle_unsubscribe(topic: TopicKey, session: &mut SessionCtx, state: &AppState) -> Dispatch {
    if !session.subscribed.remove(&topic) {
        send_error(&session.tx, "Not subscribed to that channel");
        return Dispatch::Continue;
    }

    if state.topics.unsubscribe(session.session_id, &topic) == UnsubscribeOutcome::NotSubscribed {
        // Local set and directory disagree only if teardown raced us.
        tracing::debug!(topic = %topic, "Directory had no entry for session");
    }
    tracing::info!(user_id = %session.user.user_id, topic = %topic, "Unsubscribed");

    let frame = ServerFrame::Unsubscribed {
        bunch_id: topic.bunch_id.clone(),
        channel_id: topic.channel_id.clone(),
        message: "Unsubscribed from channel".into(),
    };
    send_frame(&session.tx, &frame);
    // Remaining members learn the subscriber left.
    state.topics.publish(&topic, &frame);
    Dispatch::Continue
}

async fn handle_new_message(
    topic: TopicKey,
    content: &str,
    session: &SessionCtx,
    state: &AppState,
) -> Dispatch {
    let content = content.trim();
    if content.is_empty() {
        // Empty messages are dropped without an error frame.
        return Dispatch::Continue;
    }

    if !session.subscribed.contains(&topic) {
        send_error(&session.tx, "Not subscribed to channel");
        return Dispatch::Continue;
    }

    match state
        .store
        .create_message(
            &session.user.user_id,
            &topic.bunch_id,
            &topic.channel_id,
            content,
        )
        .await
    {
        Ok(record) => {
            tracing::info!(
                user_id = %session.user.user_id,
                message_id = %record.id,
                topic = %topic,
                "Message created"
            );
            state
                .topics
                .publish(&topic, &ServerFrame::ChatMessage { message: record });
            Dispatch::Continue
        }
        Err(StoreError::NotFound(reason)) => {
            // The store's description of what was missing stays in the log;
            // the client gets a fixed message.
            tracing::warn!(user_id = %session.user.user_id, reason = %reason, "Message rejected");
            send_error(&session.tx, "Failed to save message");
            Dispatch::Continue
        }
        Err(e) => store_failure(&session.tx, &session.user, e),
    }
}

async fn handle_reaction(
    topic: TopicKey,
    message_id: &str,
    emoji: &str,
    action: Option<ReactionAction>,
    session: &SessionCtx,
    state: &AppState,
) -> Dispatch {
    // Reaction failures never produce client error frames, only logs.
    let user_id = &session.user.user_id;

    match state.store.is_member(user_id, &topic.bunch_id, None).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(user_id = %user_id, topic = %topic, "Reaction access denied");
            return Dispatch::Continue;
        }
        Err(e) => return store_failure(&session.tx, &session.user, e),
    }

    let result = match action {
        Some(ReactionAction::Add) => state
            .reactions
            .add(user_id, &topic.bunch_id, message_id, emoji)
            .await
            .map(|outcome| match outcome {
                AddOutcome::Added(record) => Some(ServerFrame::ReactionAdded { reaction: record }),
                AddOutcome::AlreadyExists | AddOutcome::AccessDenied => None,
            }),
        Some(ReactionAction::Remove) => state
            .reactions
            .remove(user_id, &topic.bunch_id, message_id, emoji)
            .await
            .map(|outcome| match outcome {
                RemoveOutcome::Removed(record) => {
                    Some(ServerFrame::ReactionRemoved { reaction: record })
                }
                RemoveOutcome::NotFound => None,
            }),
        None => state
            .reactions
            .toggle(user_id, &topic.bunch_id, message_id, emoji)
            .await
            .map(|outcome| match outcome {
                ToggleOutcome::Added(record) => {
                    Some(ServerFrame::ReactionAdded { reaction: record })
                }
                ToggleOutcome::Removed(record) => {
                    Some(ServerFrame::ReactionRemoved { reaction: record })
                }
                ToggleOutcome::Noop => None,
            }),
    };

    match result {
        Ok(Some(frame)) => {
            state.topics.publish(&topic, &frame);
            Dispatch::Continue
        }
        Ok(None) => {
            tracing::info!(
                user_id = %user_id,
                message_id = %message_id,
                emoji = %emoji,
                "Reaction event produced no change"
            );
            Dispatch::Continue
        }
        Err(StoreError::NotFound(reason)) => {
            tracing::warn!(user_id = %user_id, reason = %reason, "Reaction target missing");
            Dispatch::Continue
        }
        Err(e) => store_failure(&session.tx, &session.user, e),
    }
}

/// Queue a frame for this session; a full or closed queue is logged, never
/// propagated.
pub fn send_frame(tx: &ConnectionSender, frame: &ServerFrame) {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server frame");
            return;
        }
    };
    if let Err(e) = tx.try_send(Message::Text(text.into())) {
        tracing::warn!(error = %e, "Failed to queue outbound frame");
    }
}

pub fn send_error(tx: &ConnectionSender, message: &str) {
    send_frame(
        tx,
        &ServerFrame::Error {
            message: message.to_string(),
        },
    );
}

fn store_failure(tx: &ConnectionSender, user: &UserIdentity, err: StoreError) -> Dispatch {
    let err = GatewayError::from(err);
    if err.is_fatal() {
        tracing::error!(user_id = %user.user_id, error = %err, "Backend unreachable");
        return Dispatch::Fatal {
            code: CLOSE_BACKEND_FAILURE,
            reason: "Backend failure",
        };
    }
    tracing::warn!(user_id = %user.user_id, error = %err, "Store error");
    send_error(tx, &err.to_string());
    Dispatch::Continue
}

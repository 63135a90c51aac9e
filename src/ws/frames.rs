//! JSON wire frames for the chat protocol.
//!
//! Every frame carries a string `type` tag. Inbound frames parse into the
//! closed `ClientFrame` union so the dispatcher's match is exhaustive;
//! unknown types are surfaced separately so they can be ignored without an
//! error frame (forward compatibility for newer clients).

use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::store::{MessageRecord, ReactionRecord};

/// Explicit direction for a `reaction` frame. Absent means toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Ping {
        timestamp: Option<Number>,
    },
    Subscribe {
        bunch_id: String,
        channel_id: String,
    },
    Unsubscribe {
        bunch_id: String,
        channel_id: String,
    },
    NewMessage {
        bunch_id: String,
        channel_id: String,
        content: String,
    },
    Reaction {
        message_id: String,
        emoji: String,
        bunch_id: String,
        channel_id: String,
        action: Option<ReactionAction>,
    },
    ReactionToggle {
        message_id: String,
        emoji: String,
        bunch_id: String,
        channel_id: String,
    },
}

/// How an inbound text frame parsed.
#[derive(Debug)]
pub enum InboundParse {
    Frame(ClientFrame),
    /// Valid JSON, recognized shape, but a `type` we do not handle.
    UnknownType(String),
    /// Valid JSON without a string `type` field.
    MissingType,
    /// Known `type` with missing or malformed fields.
    BadFields { frame_type: String, error: String },
}

#[derive(Deserialize)]
struct PingFields {
    timestamp: Option<Number>,
}

#[derive(Deserialize)]
struct TopicFields {
    bunch_id: String,
    channel_id: String,
}

#[derive(Deserialize)]
struct NewMessageFields {
    bunch_id: String,
    channel_id: String,
    content: String,
}

#[derive(Deserialize)]
struct ReactionFields {
    message_id: String,
    emoji: String,
    bunch_id: String,
    channel_id: String,
    action: Option<ReactionAction>,
}

/// Parse one inbound text frame. A top-level JSON error is the caller's cue
/// to drop the frame silently.
pub fn parse_client_frame(text: &str) -> Result<InboundParse, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let Some(frame_type) = value.get("type").and_then(|t| t.as_str()).map(String::from)
    else {
        return Ok(InboundParse::MissingType);
    };

    macro_rules! fields {
        ($ty:ty, $build:expr) => {
            match serde_json::from_value::<$ty>(value.clone()) {
                Ok(f) => InboundParse::Frame($build(f)),
                Err(e) => InboundParse::BadFields {
                    frame_type: frame_type.clone(),
                    error: e.to_string(),
                },
            }
        };
    }

    Ok(match frame_type.as_str() {
        "ping" => fields!(PingFields, |f: PingFields| ClientFrame::Ping {
            timestamp: f.timestamp,
        }),
        "subscribe" => fields!(TopicFields, |f: TopicFields| ClientFrame::Subscribe {
            bunch_id: f.bunch_id,
            channel_id: f.channel_id,
        }),
        "unsubscribe" => fields!(TopicFields, |f: TopicFields| ClientFrame::Unsubscribe {
            bunch_id: f.bunch_id,
            channel_id: f.channel_id,
        }),
        "message.new" => fields!(NewMessageFields, |f: NewMessageFields| {
            ClientFrame::NewMessage {
                bunch_id: f.bunch_id,
                channel_id: f.channel_id,
                content: f.content,
            }
        }),
        "reaction" => fields!(ReactionFields, |f: ReactionFields| ClientFrame::Reaction {
            message_id: f.message_id,
            emoji: f.emoji,
            bunch_id: f.bunch_id,
            channel_id: f.channel_id,
            action: f.action,
        }),
        "reaction.toggle" => fields!(ReactionFields, |f: ReactionFields| {
            ClientFrame::ReactionToggle {
                message_id: f.message_id,
                emoji: f.emoji,
                bunch_id: f.bunch_id,
                channel_id: f.channel_id,
            }
        }),
        _ => InboundParse::UnknownType(frame_type.clone()),
    })
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        connection_id: String,
        is_keepalive: bool,
        server_time: i64,
        message: String,
    },
    #[serde(rename = "pong")]
    Pong {
        timestamp: Number,
        server_time: i64,
    },
    #[serde(rename = "subscribed")]
    Subscribed {
        bunch_id: String,
        channel_id: String,
        message: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        bunch_id: String,
        channel_id: String,
        message: String,
    },
    #[serde(rename = "chat.message")]
    ChatMessage { message: MessageRecord },
    #[serde(rename = "reaction_added")]
    ReactionAdded { reaction: ReactionRecord },
    #[serde(rename = "reaction_removed")]
    ReactionRemoved { reaction: ReactionRecord },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    /// Milliseconds since the epoch, the `server_time` the client expects.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ConversationRef, MessageId, RoomId, UserId};

/// Events pushed from the server to a connected client.
///
/// Encoded as `{"event": "<name>", "data": <payload>}` text frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full presence snapshot, sent on every connect/disconnect
    GetOnlineUsers(Vec<UserId>),

    /// Direct-chat delivery
    NewMessage(MessagePayload),

    /// Group-chat delivery
    NewGroupMessage(MessagePayload),

    /// Direct-chat reaction update
    MessageReaction(ReactionEvent),

    /// Group-chat reaction update
    GroupMessageReaction(ReactionEvent),

    /// A client frame was rejected
    Error(ErrorPayload),
}

/// Events sent by a client over its connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    Join(RoomRequest),
    Leave(RoomRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: RoomId,
}

/// A persisted message as seen by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation: ConversationRef,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub image: Option<String>,
    pub reply_to: Option<MessageId>,
    /// Absent when the referenced message no longer resolves
    pub reply_preview: Option<ReplyPreview>,
    pub reactions: Vec<ReactionPayload>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub has_image: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub emoji: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionEvent {
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

impl ServerEvent {
    /// Wire name of the event, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetOnlineUsers(_) => "getOnlineUsers",
            Self::NewMessage(_) => "newMessage",
            Self::NewGroupMessage(_) => "newGroupMessage",
            Self::MessageReaction(_) => "messageReaction",
            Self::GroupMessageReaction(_) => "groupMessageReaction",
            Self::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientEvent {
    /// Parse a JSON text frame
    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

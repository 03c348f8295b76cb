//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize`; the real-time layer
//! converts messages into [`MessagePayload`] before putting them on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_shared::protocol::{MessagePayload, ReactionPayload, ReplyPreview};
use parley_shared::{ConversationRef, GroupId, MessageId, UserId};

use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// The direct pair or group this message belongs to.
    pub conversation: ConversationRef,
    pub sender_id: UserId,
    pub text: Option<String>,
    /// Reference to an already-uploaded image.
    pub image: Option<String>,
    /// Message this one replies to. May point at a message that no longer
    /// exists.
    pub reply_to: Option<MessageId>,
    /// Resolved reply target; `None` when `reply_to` is unset or dangling.
    pub reply_preview: Option<ReplyPreview>,
    /// Reactions in the order they were first placed.
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
}

/// Client-supplied content of a message about to be appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Trim blank fields away and enforce the text/image invariant.
    pub fn normalized(&self, max_text_len: usize) -> Result<Self> {
        let text = self
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let image = self
            .image
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .map(str::to_string);

        if text.is_none() && image.is_none() {
            return Err(StoreError::Validation(
                "message must contain text or an image".into(),
            ));
        }

        if let Some(ref t) = text {
            let len = t.chars().count();
            if len > max_text_len {
                return Err(StoreError::Validation(format!(
                    "message text is {len} characters (max {max_text_len})"
                )));
            }
        }

        if let Some(ref i) = image {
            if i.len() > parley_shared::constants::MAX_IMAGE_REF_LEN {
                return Err(StoreError::Validation("image reference too long".into()));
            }
        }

        Ok(Self {
            text,
            image,
            reply_to: self.reply_to,
        })
    }
}

impl From<&Message> for MessagePayload {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            conversation: m.conversation,
            sender_id: m.sender_id,
            text: m.text.clone(),
            image: m.image.clone(),
            reply_to: m.reply_to,
            reply_preview: m.reply_preview.clone(),
            reactions: m.reactions.iter().map(ReactionPayload::from).collect(),
            created_at: m.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// An emoji reaction. At most one per (message, user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Reaction> for ReactionPayload {
    fn from(r: &Reaction) -> Self {
        Self {
            emoji: r.emoji.clone(),
            user_id: r.user_id,
        }
    }
}

/// Result of placing a reaction: the full, updated set for the message plus
/// the conversation it lives in (needed for fan-out).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSet {
    pub message_id: MessageId,
    pub conversation: ConversationRef,
    pub reactions: Vec<Reaction>,
}

impl ReactionSet {
    /// The reaction currently held by `user`, if any.
    pub fn for_user(&self, user: &UserId) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.user_id == *user)
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A named group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub user_id: UserId,
    pub is_admin: bool,
}

// ---------------------------------------------------------------------------
// Friendship
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

// ---------------------------------------------------------------------------
// Push subscription
// ---------------------------------------------------------------------------

/// A registered push endpoint for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub id: Uuid,
    pub user_id: UserId,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

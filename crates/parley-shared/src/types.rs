use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

// User identity = opaque UUID issued by the authentication layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one live transport connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Unordered pair of participants in a direct conversation.
///
/// The pair is stored sorted so that `(a, b)` and `(b, a)` compare and hash
/// equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "[UserId; 2]", into = "[UserId; 2]")]
pub struct DirectPair {
    low: UserId,
    high: UserId,
}

impl DirectPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.low, self.high]
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.low == *user || self.high == *user
    }

    /// The participant that is not `user`. For a self-pair this is `user`.
    pub fn other(&self, user: &UserId) -> Option<UserId> {
        if self.low == *user {
            Some(self.high)
        } else if self.high == *user {
            Some(self.low)
        } else {
            None
        }
    }
}

impl From<[UserId; 2]> for DirectPair {
    fn from(pair: [UserId; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }
}

impl From<DirectPair> for [UserId; 2] {
    fn from(pair: DirectPair) -> Self {
        pair.participants()
    }
}

/// The conversation a message belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConversationRef {
    #[serde(rename_all = "camelCase")]
    Direct { participants: DirectPair },
    #[serde(rename_all = "camelCase")]
    Group { group_id: GroupId },
}

impl ConversationRef {
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self::Direct {
            participants: DirectPair::new(a, b),
        }
    }

    pub fn group(group_id: GroupId) -> Self {
        Self::Group { group_id }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { participants } => {
                let [a, b] = participants.participants();
                write!(f, "direct:{}:{}", a.short(), b.short())
            }
            Self::Group { group_id } => write!(f, "group:{}", group_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

const GROUP_ROOM_PREFIX: &str = "group:";

/// Transient delivery room for a group conversation.
///
/// Rendered as `group:<uuid>` on the wire. Parsing refuses anything without
/// the prefix, so a user id can never be mistaken for a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(GroupId);

impl RoomId {
    pub fn for_group(group_id: GroupId) -> Self {
        Self(group_id)
    }

    pub fn group_id(&self) -> GroupId {
        self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", GROUP_ROOM_PREFIX, self.0)
    }
}

impl FromStr for RoomId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(GROUP_ROOM_PREFIX)
            .ok_or_else(|| ProtocolError::InvalidRoomId(s.to_string()))?;
        let uuid =
            Uuid::parse_str(raw).map_err(|_| ProtocolError::InvalidRoomId(s.to_string()))?;
        Ok(Self(GroupId(uuid)))
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_pair_is_unordered() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(ConversationRef::direct(a, b), ConversationRef::direct(b, a));

        let pair = DirectPair::new(a, b);
        assert_eq!(pair.other(&a), Some(b));
        assert_eq!(pair.other(&b), Some(a));
        assert_eq!(pair.other(&UserId::new()), None);
    }

    #[test]
    fn deserialized_pair_is_normalised() {
        let a = UserId::new();
        let b = UserId::new();
        let json = serde_json::to_string(&[b, a]).unwrap();
        let pair: DirectPair = serde_json::from_str(&json).unwrap();
        assert_eq!(pair, DirectPair::new(a, b));
    }

    #[test]
    fn room_id_requires_group_prefix() {
        let group = GroupId::new();
        let room: RoomId = format!("group:{}", group.0).parse().unwrap();
        assert_eq!(room.group_id(), group);
        assert_eq!(room.to_string(), format!("group:{}", group.0));

        // A bare id (e.g. a user id) is not a room.
        assert!(group.0.to_string().parse::<RoomId>().is_err());
        assert!("group:not-a-uuid".parse::<RoomId>().is_err());
    }
}

//! Capability checks: who may address which conversation.
//!
//! Direct conversations require an accepted friendship between the two
//! participants; group conversations require current membership. The check is
//! implemented for a bare `Connection` so it can run inside the same
//! transaction as the write it guards.

use rusqlite::Connection;

use parley_shared::{ConversationRef, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::{friendships, groups};

pub trait AccessPolicy {
    /// May `sender` post into `conversation`?
    ///
    /// Fails with [`StoreError::NotFound`] when the conversation is a group
    /// that does not exist.
    fn may_address(&self, sender: &UserId, conversation: &ConversationRef) -> Result<bool>;

    /// May `user` see and react within `conversation`? Weaker than
    /// [`may_address`](Self::may_address) for direct chats: being one of the
    /// two participants is enough.
    fn is_participant(&self, user: &UserId, conversation: &ConversationRef) -> Result<bool>;
}

impl AccessPolicy for Connection {
    fn may_address(&self, sender: &UserId, conversation: &ConversationRef) -> Result<bool> {
        match conversation {
            ConversationRef::Direct { participants } => match participants.other(sender) {
                Some(peer) if peer != *sender => friendships::are_friends(self, sender, &peer),
                _ => Ok(false),
            },
            ConversationRef::Group { group_id } => {
                if !groups::group_exists(self, group_id)? {
                    return Err(StoreError::NotFound("group"));
                }
                groups::is_group_member(self, group_id, sender)
            }
        }
    }

    fn is_participant(&self, user: &UserId, conversation: &ConversationRef) -> Result<bool> {
        match conversation {
            ConversationRef::Direct { participants } => Ok(participants.contains(user)),
            ConversationRef::Group { group_id } => groups::is_group_member(self, group_id, user),
        }
    }
}

impl AccessPolicy for Database {
    fn may_address(&self, sender: &UserId, conversation: &ConversationRef) -> Result<bool> {
        self.conn().may_address(sender, conversation)
    }

    fn is_participant(&self, user: &UserId, conversation: &ConversationRef) -> Result<bool> {
        self.conn().is_participant(user, conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FriendshipStatus;
    use parley_shared::GroupId;

    #[test]
    fn direct_requires_friendship() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (UserId::new(), UserId::new());
        let conv = ConversationRef::direct(a, b);

        assert!(!db.may_address(&a, &conv).unwrap());
        db.upsert_friendship(&b, &a, FriendshipStatus::Accepted).unwrap();
        assert!(db.may_address(&a, &conv).unwrap());
        assert!(db.may_address(&b, &conv).unwrap());

        // An outsider is never authorized, friend or not.
        let outsider = UserId::new();
        db.upsert_friendship(&outsider, &a, FriendshipStatus::Accepted).unwrap();
        assert!(!db.may_address(&outsider, &conv).unwrap());
    }

    #[test]
    fn self_conversation_is_refused() {
        let db = Database::open_in_memory().unwrap();
        let a = UserId::new();
        assert!(!db.may_address(&a, &ConversationRef::direct(a, a)).unwrap());
    }

    #[test]
    fn group_requires_membership() {
        let mut db = Database::open_in_memory().unwrap();
        let (owner, member, outsider) = (UserId::new(), UserId::new(), UserId::new());
        let group = db.create_group("g", &owner, &[member]).unwrap();
        let conv = ConversationRef::group(group.id);

        assert!(db.may_address(&owner, &conv).unwrap());
        assert!(db.may_address(&member, &conv).unwrap());
        assert!(!db.may_address(&outsider, &conv).unwrap());
        assert!(!db.is_participant(&outsider, &conv).unwrap());
    }

    #[test]
    fn missing_group_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationRef::group(GroupId::new());
        assert!(matches!(
            db.may_address(&UserId::new(), &conv),
            Err(StoreError::NotFound("group"))
        ));
    }
}

use chrono::Utc;
use rusqlite::{params, Connection};

use parley_shared::constants::MAX_EMOJI_LEN;
use parley_shared::{MessageId, UserId};

use crate::access::AccessPolicy;
use crate::columns::{timestamp_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages;
use crate::models::{Reaction, ReactionSet};

impl Database {
    /// Place `emoji` on a message for `user`, replacing any earlier reaction
    /// from the same user.
    ///
    /// The replaced reaction keeps its position in the set. Returns the full
    /// updated set.
    pub fn add_reaction(
        &mut self,
        message_id: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<ReactionSet> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > MAX_EMOJI_LEN {
            return Err(StoreError::Validation(format!(
                "reaction must be 1..={MAX_EMOJI_LEN} bytes"
            )));
        }

        let tx = self.conn_mut().transaction()?;

        let conversation = messages::message_conversation(&tx, message_id)?;
        if !tx.is_participant(user, &conversation)? {
            return Err(StoreError::Unauthorized(
                "user is not a participant of this conversation".into(),
            ));
        }

        tx.execute(
            "INSERT INTO reactions (message_id, user_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (message_id, user_id)
             DO UPDATE SET emoji = excluded.emoji",
            params![
                message_id.to_string(),
                user.to_string(),
                emoji,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let reactions = reactions_for_message(&tx, message_id)?;
        tx.commit()?;

        tracing::debug!(message = %message_id, user = %user, emoji, "reaction placed");

        Ok(ReactionSet {
            message_id: *message_id,
            conversation,
            reactions,
        })
    }

    pub fn get_reactions_for_message(&self, message_id: &MessageId) -> Result<Vec<Reaction>> {
        // Distinguish "no reactions" from "no such message".
        messages::message_conversation(self.conn(), message_id)?;
        reactions_for_message(self.conn(), message_id)
    }
}

pub(crate) fn reactions_for_message(
    conn: &Connection,
    message_id: &MessageId,
) -> Result<Vec<Reaction>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, user_id, emoji, created_at
         FROM reactions WHERE message_id = ?1 ORDER BY rowid ASC",
    )?;

    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        Ok(Reaction {
            message_id: MessageId(uuid_at(row, 0)?),
            user_id: UserId(uuid_at(row, 1)?),
            emoji: row.get(2)?,
            created_at: timestamp_at(row, 3)?,
        })
    })?;

    let mut reactions = Vec::new();
    for row in rows {
        reactions.push(row?);
    }
    Ok(reactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FriendshipStatus, NewMessage};
    use parley_shared::ConversationRef;

    fn direct_message(db: &mut Database) -> (UserId, UserId, MessageId) {
        let (a, b) = (UserId::new(), UserId::new());
        db.upsert_friendship(&a, &b, FriendshipStatus::Accepted).unwrap();
        let msg = db
            .append_message(&ConversationRef::direct(a, b), &a, &NewMessage::text("hi"))
            .unwrap();
        (a, b, msg.id)
    }

    #[test]
    fn second_reaction_replaces_first() {
        let mut db = Database::open_in_memory().unwrap();
        let (a, b, msg) = direct_message(&mut db);

        db.add_reaction(&msg, &b, "👍").unwrap();
        db.add_reaction(&msg, &a, "😂").unwrap();
        let set = db.add_reaction(&msg, &b, "❤️").unwrap();

        assert_eq!(set.reactions.len(), 2);
        let mine: Vec<_> = set.reactions.iter().filter(|r| r.user_id == b).collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].emoji, "❤️");
        // Replacement keeps the original slot.
        assert_eq!(set.reactions[0].user_id, b);
        assert_eq!(set.for_user(&a).map(|r| r.emoji.as_str()), Some("😂"));
    }

    #[test]
    fn reaction_on_missing_message() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .add_reaction(&MessageId::new(), &UserId::new(), "👍")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("message")));
    }

    #[test]
    fn outsiders_cannot_react() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, _, msg) = direct_message(&mut db);

        let err = db.add_reaction(&msg, &UserId::new(), "👍").unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
        assert!(db.get_reactions_for_message(&msg).unwrap().is_empty());
    }

    #[test]
    fn reactions_are_listed_with_messages() {
        let mut db = Database::open_in_memory().unwrap();
        let (a, b, msg) = direct_message(&mut db);
        db.add_reaction(&msg, &b, "🔥").unwrap();

        let listed = db
            .list_messages(&ConversationRef::direct(a, b), None, 10)
            .unwrap();
        assert_eq!(listed[0].reactions.len(), 1);
        assert_eq!(listed[0].reactions[0].emoji, "🔥");
    }
}

//! Friendship lookups.
//!
//! Friend requests are created and answered by an external service that
//! shares this database. The chat core only reads them; the upsert helper
//! exists for seeding.

use chrono::Utc;
use rusqlite::{params, Connection};

use parley_shared::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::models::FriendshipStatus;

impl Database {
    /// Insert or update the directed friendship `requester -> addressee`.
    pub fn upsert_friendship(
        &self,
        requester: &UserId,
        addressee: &UserId,
        status: FriendshipStatus,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO friendships (requester_id, addressee_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (requester_id, addressee_id)
             DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
            params![
                requester.to_string(),
                addressee.to_string(),
                status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool> {
        are_friends(self.conn(), a, b)
    }
}

/// True when an accepted friendship exists in either direction.
pub(crate) fn are_friends(conn: &Connection, a: &UserId, b: &UserId) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (
             SELECT 1 FROM friendships
             WHERE status = 'accepted'
               AND ((requester_id = ?1 AND addressee_id = ?2)
                 OR (requester_id = ?2 AND addressee_id = ?1))
         )",
        params![a.to_string(), b.to_string()],
        |row| row.get(0),
    )?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_in_either_direction() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (UserId::new(), UserId::new());

        assert!(!db.are_friends(&a, &b).unwrap());

        db.upsert_friendship(&a, &b, FriendshipStatus::Pending).unwrap();
        assert!(!db.are_friends(&a, &b).unwrap());

        db.upsert_friendship(&a, &b, FriendshipStatus::Accepted).unwrap();
        assert!(db.are_friends(&a, &b).unwrap());
        assert!(db.are_friends(&b, &a).unwrap());
    }

    #[test]
    fn rejected_is_not_friends() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (UserId::new(), UserId::new());

        db.upsert_friendship(&b, &a, FriendshipStatus::Rejected).unwrap();
        assert!(!db.are_friends(&a, &b).unwrap());
    }
}

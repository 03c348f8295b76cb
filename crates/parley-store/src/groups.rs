//! CRUD operations for [`Group`] records and their membership.
//!
//! Invariants kept here: the creator is an admin member from creation on and
//! can never be removed; admin status lives on the membership row, so an
//! admin is always a member.

use chrono::Utc;
use rusqlite::{params, Connection};

use parley_shared::{GroupId, UserId};

use crate::columns::{not_found, timestamp_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Group, GroupMember};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a group owned by `creator`, with `members` added alongside.
    pub fn create_group(
        &mut self,
        name: &str,
        creator: &UserId,
        members: &[UserId],
    ) -> Result<Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("group name must not be empty".into()));
        }

        let group = Group {
            id: GroupId::new(),
            name: name.to_string(),
            creator_id: *creator,
            created_at: Utc::now(),
        };

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO chat_groups (id, name, creator_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group.id.to_string(),
                group.name,
                creator.to_string(),
                group.created_at.to_rfc3339(),
            ],
        )?;
        insert_member(&tx, &group.id, creator, true)?;
        for member in members.iter().filter(|m| *m != creator) {
            insert_member(&tx, &group.id, member, false)?;
        }
        tx.commit()?;

        tracing::debug!(group = %group.id, members = members.len() + 1, "created group");
        Ok(group)
    }

    /// Add a member. Returns `false` if the user already belonged to the group.
    pub fn add_group_member(&self, group: &GroupId, user: &UserId, is_admin: bool) -> Result<bool> {
        // Surface a missing group as NotFound rather than an FK violation.
        self.get_group(group)?;
        insert_member(self.conn(), group, user, is_admin)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_group(&self, id: &GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT id, name, creator_id, created_at FROM chat_groups WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Group {
                        id: GroupId(uuid_at(row, 0)?),
                        name: row.get(1)?,
                        creator_id: UserId(uuid_at(row, 2)?),
                        created_at: timestamp_at(row, 3)?,
                    })
                },
            )
            .map_err(not_found("group"))
    }

    /// List members, oldest first.
    pub fn group_members(&self, group: &GroupId) -> Result<Vec<GroupMember>> {
        group_members(self.conn(), group)
    }

    pub fn is_group_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        is_group_member(self.conn(), group, user)
    }

    pub fn is_group_admin(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        let found: bool = self.conn().query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM group_members
                 WHERE group_id = ?1 AND user_id = ?2 AND is_admin = 1
             )",
            params![group.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove a member. Returns `true` if a row was deleted.
    ///
    /// The creator cannot be removed while the group exists.
    pub fn remove_group_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        let existing = self.get_group(group)?;
        if existing.creator_id == *user {
            return Err(StoreError::Validation(
                "the group creator cannot be removed".into(),
            ));
        }

        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), user.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn insert_member(conn: &Connection, group: &GroupId, user: &UserId, is_admin: bool) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO group_members (group_id, user_id, is_admin, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            group.to_string(),
            user.to_string(),
            is_admin,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(affected > 0)
}

pub(crate) fn is_group_member(conn: &Connection, group: &GroupId, user: &UserId) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2)",
        params![group.to_string(), user.to_string()],
        |row| row.get(0),
    )?;
    Ok(found)
}

pub(crate) fn group_exists(conn: &Connection, group: &GroupId) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM chat_groups WHERE id = ?1)",
        params![group.to_string()],
        |row| row.get(0),
    )?;
    Ok(found)
}

pub(crate) fn group_members(conn: &Connection, group: &GroupId) -> Result<Vec<GroupMember>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, is_admin FROM group_members
         WHERE group_id = ?1
         ORDER BY joined_at ASC, rowid ASC",
    )?;

    let rows = stmt.query_map(params![group.to_string()], |row| {
        Ok(GroupMember {
            user_id: UserId(uuid_at(row, 0)?),
            is_admin: row.get(1)?,
        })
    })?;

    let mut members = Vec::new();
    for row in rows {
        members.push(row?);
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_is_admin_member() {
        let mut db = Database::open_in_memory().unwrap();
        let (owner, b, c) = (UserId::new(), UserId::new(), UserId::new());

        let group = db.create_group("  friends ", &owner, &[b, c, owner]).unwrap();
        assert_eq!(group.name, "friends");

        let members = db.group_members(&group.id).unwrap();
        assert_eq!(members.len(), 3);
        assert!(db.is_group_admin(&group.id, &owner).unwrap());
        assert!(!db.is_group_admin(&group.id, &b).unwrap());
        assert!(db.is_group_member(&group.id, &c).unwrap());
    }

    #[test]
    fn creator_cannot_be_removed() {
        let mut db = Database::open_in_memory().unwrap();
        let (owner, b) = (UserId::new(), UserId::new());
        let group = db.create_group("g", &owner, &[b]).unwrap();

        assert!(matches!(
            db.remove_group_member(&group.id, &owner),
            Err(StoreError::Validation(_))
        ));
        assert!(db.remove_group_member(&group.id, &b).unwrap());
        assert!(!db.remove_group_member(&group.id, &b).unwrap());
        assert!(!db.is_group_member(&group.id, &b).unwrap());
    }

    #[test]
    fn removing_an_admin_drops_admin_status() {
        let mut db = Database::open_in_memory().unwrap();
        let (owner, b) = (UserId::new(), UserId::new());
        let group = db.create_group("g", &owner, &[]).unwrap();

        assert!(db.add_group_member(&group.id, &b, true).unwrap());
        assert!(!db.add_group_member(&group.id, &b, true).unwrap());
        assert!(db.is_group_admin(&group.id, &b).unwrap());

        db.remove_group_member(&group.id, &b).unwrap();
        assert!(!db.is_group_admin(&group.id, &b).unwrap());
    }

    #[test]
    fn unknown_group_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .add_group_member(&GroupId::new(), &UserId::new(), false)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("group")));
    }
}

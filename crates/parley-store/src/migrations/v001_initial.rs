//! v001 -- Initial schema creation.
//!
//! Creates the core tables: `chat_groups`, `group_members`, `friendships`,
//! `messages` and `reactions`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    name       TEXT NOT NULL,
    creator_id TEXT NOT NULL,                 -- user UUID
    created_at TEXT NOT NULL                  -- ISO-8601 / RFC-3339
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id  TEXT NOT NULL,                  -- FK -> chat_groups(id)
    user_id   TEXT NOT NULL,
    is_admin  INTEGER NOT NULL DEFAULT 0,     -- boolean 0/1
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

-- ----------------------------------------------------------------
-- Friendships (written by the friendship service, read here)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    requester_id TEXT NOT NULL,
    addressee_id TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
    updated_at   TEXT NOT NULL,

    PRIMARY KEY (requester_id, addressee_id)
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,  -- persistence order
    id               TEXT NOT NULL UNIQUE,               -- UUID v4
    conversation_key TEXT NOT NULL,                      -- group:<id> | direct:<low>:<high>
    group_id         TEXT,                               -- FK -> chat_groups(id)
    participant_low  TEXT,                               -- direct pair, sorted
    participant_high TEXT,
    sender_id        TEXT NOT NULL,
    text             TEXT,
    image            TEXT,                               -- uploaded image reference
    reply_to         TEXT,                               -- message UUID, may dangle
    created_at       TEXT NOT NULL,

    CHECK (text IS NOT NULL OR image IS NOT NULL),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_key, seq);

-- ----------------------------------------------------------------
-- Reactions (one per message and user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,                 -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    UNIQUE (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

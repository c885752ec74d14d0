//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `identities`, `threads`, `thread_members`,
//! `messages`, and `message_keys`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities
-- ----------------------------------------------------------------
-- One row per user holding chat keys. The private key is stored
-- encrypted under a passphrase-derived key; identity_version bumps on
-- every wholesale replacement so stale session caches can be detected.
CREATE TABLE IF NOT EXISTS identities (
    user_id               INTEGER PRIMARY KEY NOT NULL,
    public_key            BLOB NOT NULL,        -- 1184 bytes
    encrypted_private_key BLOB NOT NULL,
    key_salt              BLOB NOT NULL,        -- 16 bytes
    key_nonce             BLOB NOT NULL,        -- 12 bytes
    identity_version      INTEGER NOT NULL DEFAULT 1,
    enabled_at            TEXT NOT NULL,        -- ISO-8601 / RFC-3339
    rotated_at            TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Threads
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS threads (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind       TEXT NOT NULL CHECK (kind IN ('dm', 'group')),
    title      TEXT,
    creator_id INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_members (
    thread_id  INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    is_admin   INTEGER NOT NULL DEFAULT 0,     -- boolean 0/1
    joined_at  TEXT NOT NULL,

    PRIMARY KEY (thread_id, user_id),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_thread_members_user ON thread_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id       INTEGER NOT NULL,
    sender_id       INTEGER NOT NULL,
    body_ciphertext BLOB NOT NULL,             -- opaque ciphertext
    body_nonce      BLOB NOT NULL,             -- 12 bytes
    created_at      TEXT NOT NULL,

    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_ts
    ON messages(thread_id, created_at ASC);

-- ----------------------------------------------------------------
-- Message keys
-- ----------------------------------------------------------------
-- One row per (message, recipient): the message key wrapped for that
-- recipient. read_at doubles as the per-member read marker; the sender's
-- own row is born read.
CREATE TABLE IF NOT EXISTS message_keys (
    message_id     INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    kem_ciphertext BLOB NOT NULL,              -- 1088 bytes
    wrapped_key    BLOB NOT NULL,
    wrap_nonce     BLOB NOT NULL,              -- 12 bytes
    read_at        TEXT,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_keys_user ON message_keys(user_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

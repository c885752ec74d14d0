//! CRUD operations for [`StoredMessage`] and [`MessageKeyRow`] rows.
//!
//! A message and its full set of per-recipient key rows are written in one
//! transaction: every current member gets exactly one row, and the sender's
//! own row is created already read.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use arbor_shared::{MessageId, SealedMessage, ThreadId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{MessageKeyRow, MessageWithKeys, StoredMessage};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Persist one sealed message: the body ciphertext plus one wrapped-key
    /// row per member, transactionally.
    pub fn insert_sealed_message(
        &self,
        thread_id: ThreadId,
        sender_id: UserId,
        sealed: &SealedMessage,
        now: DateTime<Utc>,
    ) -> Result<MessageId> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO messages (thread_id, sender_id, body_ciphertext, body_nonce, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread_id.0,
                sender_id.0,
                sealed.body_ciphertext,
                sealed.body_nonce.as_slice(),
                now.to_rfc3339(),
            ],
        )?;
        let message_id = tx.last_insert_rowid();

        for (user_id, wrap) in &sealed.wraps {
            let read_at = if *user_id == sender_id {
                Some(now.to_rfc3339())
            } else {
                None
            };
            tx.execute(
                "INSERT INTO message_keys
                     (message_id, user_id, kem_ciphertext, wrapped_key, wrap_nonce, read_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message_id,
                    user_id.0,
                    wrap.kem_ciphertext,
                    wrap.wrapped_key,
                    wrap.nonce.as_slice(),
                    read_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(MessageId(message_id))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch one message joined with all of its key rows.
    pub fn message_with_keys(&self, id: MessageId) -> Result<MessageWithKeys> {
        let message = self
            .conn()
            .query_row(
                "SELECT id, thread_id, sender_id, body_ciphertext, body_nonce, created_at
                 FROM messages WHERE id = ?1",
                params![id.0],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        Ok(MessageWithKeys {
            keys: self.keys_for_message(id)?,
            message,
        })
    }

    /// Full history of a thread, oldest first, each message with its keys.
    pub fn history_for_thread(&self, thread_id: ThreadId) -> Result<Vec<MessageWithKeys>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, thread_id, sender_id, body_ciphertext, body_nonce, created_at
             FROM messages
             WHERE thread_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![thread_id.0], row_to_message)?;

        let mut history = Vec::new();
        for row in rows {
            let message = row?;
            let keys = self.keys_for_message(message.id)?;
            history.push(MessageWithKeys { message, keys });
        }
        Ok(history)
    }

    /// The newest message of a thread, if any.
    pub fn last_message_for_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<MessageWithKeys>> {
        let message = self
            .conn()
            .query_row(
                "SELECT id, thread_id, sender_id, body_ciphertext, body_nonce, created_at
                 FROM messages
                 WHERE thread_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![thread_id.0],
                row_to_message,
            )
            .optional()?;

        match message {
            Some(message) => Ok(Some(MessageWithKeys {
                keys: self.keys_for_message(message.id)?,
                message,
            })),
            None => Ok(None),
        }
    }

    /// Unread message counts per thread for one user.
    pub fn unread_counts(&self, user: UserId) -> Result<HashMap<ThreadId, i64>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.thread_id, COUNT(*)
             FROM messages m
             JOIN message_keys k ON k.message_id = m.id
             WHERE k.user_id = ?1 AND k.read_at IS NULL
             GROUP BY m.thread_id",
        )?;

        let rows = stmt.query_map(params![user.0], |row| {
            Ok((ThreadId(row.get(0)?), row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (thread_id, count) = row?;
            counts.insert(thread_id, count);
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Update / delete
    // ------------------------------------------------------------------

    /// Mark every unread message in a thread as read for `user` (messages
    /// the user sent are born read). Returns the number of rows touched.
    pub fn mark_thread_read(
        &self,
        thread_id: ThreadId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE message_keys SET read_at = ?1
             WHERE user_id = ?2 AND read_at IS NULL
               AND message_id IN
                   (SELECT id FROM messages WHERE thread_id = ?3 AND sender_id != ?2)",
            params![now.to_rfc3339(), user.0, thread_id.0],
        )?;
        Ok(affected)
    }

    /// Delete a message for everyone. Key rows cascade.
    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }

    /// Delete only one user's key row, leaving the message readable for
    /// everyone else ("delete for me").
    pub fn delete_key_for_user(&self, id: MessageId, user: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM message_keys WHERE message_id = ?1 AND user_id = ?2",
            params![id.0, user.0],
        )?;
        Ok(affected > 0)
    }

    fn keys_for_message(&self, id: MessageId) -> Result<Vec<MessageKeyRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, user_id, kem_ciphertext, wrapped_key, wrap_nonce, read_at
             FROM message_keys
             WHERE message_id = ?1",
        )?;

        let rows = stmt.query_map(params![id.0], row_to_key)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let created_str: String = row.get(5)?;
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredMessage {
        id: MessageId(row.get(0)?),
        thread_id: ThreadId(row.get(1)?),
        sender_id: UserId(row.get(2)?),
        body_ciphertext: row.get(3)?,
        body_nonce: row.get(4)?,
        created_at,
    })
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageKeyRow> {
    let read_str: Option<String> = row.get(5)?;
    let read_at = read_str
        .map(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        })
        .transpose()?;

    Ok(MessageKeyRow {
        message_id: MessageId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        kem_ciphertext: row.get(2)?,
        wrapped_key: row.get(3)?,
        wrap_nonce: row.get(4)?,
        read_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_shared::codec;
    use arbor_shared::Identity;

    fn seeded() -> (Database, ThreadId, UserId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let alice = UserId(1);
        let bob = UserId(2);
        for (user, pass) in [(alice, "p1"), (bob, "p2")] {
            let identity = Identity::generate(pass).unwrap();
            db.upsert_identity(user, &identity, now).unwrap();
        }
        let thread = db.get_or_create_dm_thread(alice, bob, now).unwrap();
        (db, thread.id, alice, bob)
    }

    fn send(db: &Database, thread: ThreadId, sender: UserId, body: &str) -> MessageId {
        let member_ids: Vec<UserId> = db
            .thread_members(thread)
            .unwrap()
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        let members = db.public_keys_for(&member_ids).unwrap();
        let sealed = codec::encrypt_for_thread(body, &members, sender).unwrap();
        db.insert_sealed_message(thread, sender, &sealed, Utc::now())
            .unwrap()
    }

    #[test]
    fn insert_writes_one_key_row_per_member() {
        let (db, thread, alice, bob) = seeded();
        let id = send(&db, thread, alice, "first whisper");

        let loaded = db.message_with_keys(id).unwrap();
        assert_eq!(loaded.keys.len(), 2);
        // Sender's copy is born read; the recipient's is not.
        assert!(loaded.key_for(alice).unwrap().read_at.is_some());
        assert!(loaded.key_for(bob).unwrap().read_at.is_none());
    }

    #[test]
    fn unread_counts_and_mark_read() {
        let (db, thread, alice, bob) = seeded();
        send(&db, thread, alice, "one");
        send(&db, thread, alice, "two");

        assert_eq!(db.unread_counts(bob).unwrap().get(&thread), Some(&2));
        assert_eq!(db.unread_counts(alice).unwrap().get(&thread), None);

        assert_eq!(db.mark_thread_read(thread, bob, Utc::now()).unwrap(), 2);
        assert_eq!(db.unread_counts(bob).unwrap().get(&thread), None);
    }

    #[test]
    fn history_is_oldest_first() {
        let (db, thread, alice, bob) = seeded();
        let first = send(&db, thread, alice, "one");
        let second = send(&db, thread, bob, "two");

        let history = db.history_for_thread(thread).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.id, first);
        assert_eq!(history[1].message.id, second);

        let last = db.last_message_for_thread(thread).unwrap().unwrap();
        assert_eq!(last.message.id, second);
    }

    #[test]
    fn delete_message_cascades_keys() {
        let (db, thread, alice, _) = seeded();
        let id = send(&db, thread, alice, "ephemeral");

        assert!(db.delete_message(id).unwrap());
        assert!(matches!(db.message_with_keys(id), Err(StoreError::NotFound)));
        let orphans: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM message_keys WHERE message_id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn delete_for_me_removes_only_one_key() {
        let (db, thread, alice, bob) = seeded();
        let id = send(&db, thread, alice, "kept for bob");

        assert!(db.delete_key_for_user(id, alice).unwrap());
        let loaded = db.message_with_keys(id).unwrap();
        assert!(loaded.key_for(alice).is_none());
        assert!(loaded.key_for(bob).is_some());
    }
}

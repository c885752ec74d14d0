//! CRUD operations for [`Thread`] and [`ThreadMember`] rows.
//!
//! Leaving a thread removes only the membership row. Already-persisted
//! `message_keys` rows for the departed user are left in place: distributed
//! wraps are never retroactively revoked.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use arbor_shared::constants::GROUP_MEMBER_LIMIT;
use arbor_shared::{ThreadId, ThreadKind, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Thread, ThreadMember};

/// Outcome of removing a member from a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberDeparture {
    /// Membership removed; the thread lives on.
    Left,
    /// Membership removed and an admin-less group promoted its
    /// earliest-joined remaining member.
    LeftWithPromotion(UserId),
    /// The departing user was the last member; the thread was deleted.
    ThreadDeleted,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Find the existing DM thread between two users, or create one.
    pub fn get_or_create_dm_thread(
        &self,
        creator: UserId,
        partner: UserId,
        now: DateTime<Utc>,
    ) -> Result<Thread> {
        if creator == partner {
            return Err(StoreError::Constraint(
                "a DM requires two distinct users".into(),
            ));
        }

        let existing: Option<i64> = self
            .conn()
            .query_row(
                "SELECT t.id
                 FROM threads t
                 JOIN thread_members m ON m.thread_id = t.id
                 WHERE t.kind = 'dm' AND m.user_id IN (?1, ?2)
                 GROUP BY t.id
                 HAVING COUNT(DISTINCT m.user_id) = 2
                 LIMIT 1",
                params![creator.0, partner.0],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            let thread = self.get_thread(ThreadId(id))?;
            // Guard against a thread that merely contains both users among
            // others; DM member sets are exactly the pair.
            let members: Vec<UserId> = self
                .thread_members(thread.id)?
                .into_iter()
                .map(|m| m.user_id)
                .collect();
            if members.len() == 2 && members.contains(&creator) && members.contains(&partner) {
                return Ok(thread);
            }
        }

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO threads (kind, title, creator_id, created_at)
             VALUES ('dm', NULL, ?1, ?2)",
            params![creator.0, now.to_rfc3339()],
        )?;
        let thread_id = tx.last_insert_rowid();
        for user in [creator, partner] {
            tx.execute(
                "INSERT INTO thread_members (thread_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, 1, ?3)",
                params![thread_id, user.0, now.to_rfc3339()],
            )?;
        }
        tx.commit()?;

        self.get_thread(ThreadId(thread_id))
    }

    /// Create a group thread. `member_ids` may or may not include the
    /// creator; the creator is always a member and the only initial admin.
    pub fn create_group_thread(
        &self,
        creator: UserId,
        title: &str,
        member_ids: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<Thread> {
        let mut members: Vec<UserId> = Vec::with_capacity(member_ids.len() + 1);
        members.push(creator);
        for id in member_ids {
            if !members.contains(id) {
                members.push(*id);
            }
        }

        if members.len() < 2 {
            return Err(StoreError::Constraint(
                "a group needs at least one member besides the creator".into(),
            ));
        }
        if members.len() > GROUP_MEMBER_LIMIT {
            return Err(StoreError::Constraint(format!(
                "groups are limited to {GROUP_MEMBER_LIMIT} members"
            )));
        }

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO threads (kind, title, creator_id, created_at)
             VALUES ('group', ?1, ?2, ?3)",
            params![title, creator.0, now.to_rfc3339()],
        )?;
        let thread_id = tx.last_insert_rowid();
        for user in &members {
            tx.execute(
                "INSERT INTO thread_members (thread_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![thread_id, user.0, (*user == creator) as i64, now.to_rfc3339()],
            )?;
        }
        tx.commit()?;

        self.get_thread(ThreadId(thread_id))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single thread.
    pub fn get_thread(&self, id: ThreadId) -> Result<Thread> {
        self.conn()
            .query_row(
                "SELECT id, kind, title, creator_id, created_at
                 FROM threads WHERE id = ?1",
                params![id.0],
                row_to_thread,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// All members of a thread, earliest joiner first.
    pub fn thread_members(&self, thread_id: ThreadId) -> Result<Vec<ThreadMember>> {
        let mut stmt = self.conn().prepare(
            "SELECT thread_id, user_id, is_admin, joined_at
             FROM thread_members
             WHERE thread_id = ?1
             ORDER BY joined_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![thread_id.0], row_to_member)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Whether `user` is currently a member of `thread_id`.
    pub fn is_member(&self, thread_id: ThreadId, user: UserId) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM thread_members WHERE thread_id = ?1 AND user_id = ?2",
                params![thread_id.0, user.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All threads `user` belongs to, newest first.
    pub fn threads_for_user(&self, user: UserId) -> Result<Vec<Thread>> {
        let mut stmt = self.conn().prepare(
            "SELECT t.id, t.kind, t.title, t.creator_id, t.created_at
             FROM threads t
             JOIN thread_members m ON m.thread_id = t.id
             WHERE m.user_id = ?1
             ORDER BY t.created_at DESC, t.id DESC",
        )?;

        let rows = stmt.query_map(params![user.0], row_to_thread)?;

        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    // ------------------------------------------------------------------
    // Update / delete
    // ------------------------------------------------------------------

    /// Add a member to a group thread.
    pub fn add_member(
        &self,
        thread_id: ThreadId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let thread = self.get_thread(thread_id)?;
        if thread.kind != ThreadKind::Group {
            return Err(StoreError::Constraint(
                "members can only be added to group threads".into(),
            ));
        }
        if self.is_member(thread_id, user)? {
            return Err(StoreError::Constraint("already a member".into()));
        }
        let count = self.thread_members(thread_id)?.len();
        if count >= GROUP_MEMBER_LIMIT {
            return Err(StoreError::Constraint(format!(
                "groups are limited to {GROUP_MEMBER_LIMIT} members"
            )));
        }

        self.conn().execute(
            "INSERT INTO thread_members (thread_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, 0, ?3)",
            params![thread_id.0, user.0, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Remove a member. Deletes the thread when it empties; promotes the
    /// earliest-joined remaining member when a group loses its last admin.
    pub fn remove_member(&self, thread_id: ThreadId, user: UserId) -> Result<MemberDeparture> {
        let thread = self.get_thread(thread_id)?;

        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "DELETE FROM thread_members WHERE thread_id = ?1 AND user_id = ?2",
            params![thread_id.0, user.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM thread_members WHERE thread_id = ?1",
            params![thread_id.0],
            |row| row.get(0),
        )?;

        if remaining == 0 {
            tx.execute("DELETE FROM threads WHERE id = ?1", params![thread_id.0])?;
            tx.commit()?;
            return Ok(MemberDeparture::ThreadDeleted);
        }

        let mut departure = MemberDeparture::Left;
        if thread.kind == ThreadKind::Group {
            let admins: i64 = tx.query_row(
                "SELECT COUNT(*) FROM thread_members WHERE thread_id = ?1 AND is_admin = 1",
                params![thread_id.0],
                |row| row.get(0),
            )?;
            if admins == 0 {
                let promote: i64 = tx.query_row(
                    "SELECT user_id FROM thread_members
                     WHERE thread_id = ?1
                     ORDER BY joined_at ASC, user_id ASC
                     LIMIT 1",
                    params![thread_id.0],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "UPDATE thread_members SET is_admin = 1
                     WHERE thread_id = ?1 AND user_id = ?2",
                    params![thread_id.0, promote],
                )?;
                departure = MemberDeparture::LeftWithPromotion(UserId(promote));
            }
        }

        tx.commit()?;
        Ok(departure)
    }

    /// Delete a thread outright (group deletion by its founder). Cascades
    /// to memberships, messages and message keys.
    pub fn delete_thread(&self, thread_id: ThreadId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM threads WHERE id = ?1", params![thread_id.0])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let id: i64 = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let title: Option<String> = row.get(2)?;
    let creator_id: i64 = row.get(3)?;
    let created_str: String = row.get(4)?;

    let kind = ThreadKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown thread kind: {kind_str}").into(),
        )
    })?;

    let created_at = chrono::DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Thread {
        id: ThreadId(id),
        kind,
        title,
        creator_id: UserId(creator_id),
        created_at,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadMember> {
    let thread_id: i64 = row.get(0)?;
    let user_id: i64 = row.get(1)?;
    let is_admin: i64 = row.get(2)?;
    let joined_str: String = row.get(3)?;

    let joined_at = chrono::DateTime::parse_from_rfc3339(&joined_str)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ThreadMember {
        thread_id: ThreadId(thread_id),
        user_id: UserId(user_id),
        is_admin: is_admin != 0,
        joined_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn dm_thread_is_reused() {
        let db = db();
        let now = Utc::now();
        let first = db
            .get_or_create_dm_thread(UserId(1), UserId(2), now)
            .unwrap();
        let second = db
            .get_or_create_dm_thread(UserId(2), UserId(1), now)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.thread_members(first.id).unwrap().len(), 2);
    }

    #[test]
    fn dm_with_self_rejected() {
        let db = db();
        assert!(matches!(
            db.get_or_create_dm_thread(UserId(1), UserId(1), Utc::now()),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn group_limits_enforced() {
        let db = db();
        let now = Utc::now();
        let too_many: Vec<UserId> = (2..=20).map(UserId).collect();
        assert!(matches!(
            db.create_group_thread(UserId(1), "Big Room", &too_many, now),
            Err(StoreError::Constraint(_))
        ));
        assert!(matches!(
            db.create_group_thread(UserId(1), "Lonely", &[], now),
            Err(StoreError::Constraint(_))
        ));
    }

    #[test]
    fn group_creator_is_admin() {
        let db = db();
        let thread = db
            .create_group_thread(UserId(1), "Council", &[UserId(2), UserId(3)], Utc::now())
            .unwrap();
        let members = db.thread_members(thread.id).unwrap();
        assert_eq!(members.len(), 3);
        let creator = members.iter().find(|m| m.user_id == UserId(1)).unwrap();
        assert!(creator.is_admin);
        assert!(members
            .iter()
            .filter(|m| m.user_id != UserId(1))
            .all(|m| !m.is_admin));
    }

    #[test]
    fn last_admin_departure_promotes_earliest_joiner() {
        let db = db();
        let now = Utc::now();
        let thread = db
            .create_group_thread(UserId(1), "Council", &[UserId(2), UserId(3)], now)
            .unwrap();
        // Stagger a later joiner so the promotion order is observable.
        db.add_member(thread.id, UserId(4), now + Duration::seconds(5))
            .unwrap();

        let departure = db.remove_member(thread.id, UserId(1)).unwrap();
        assert_eq!(departure, MemberDeparture::LeftWithPromotion(UserId(2)));

        let members = db.thread_members(thread.id).unwrap();
        assert!(members
            .iter()
            .find(|m| m.user_id == UserId(2))
            .unwrap()
            .is_admin);
    }

    #[test]
    fn emptied_thread_is_deleted() {
        let db = db();
        let thread = db
            .get_or_create_dm_thread(UserId(1), UserId(2), Utc::now())
            .unwrap();
        assert_eq!(
            db.remove_member(thread.id, UserId(1)).unwrap(),
            MemberDeparture::Left
        );
        assert_eq!(
            db.remove_member(thread.id, UserId(2)).unwrap(),
            MemberDeparture::ThreadDeleted
        );
        assert!(matches!(db.get_thread(thread.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn add_member_constraints() {
        let db = db();
        let now = Utc::now();
        let dm = db.get_or_create_dm_thread(UserId(1), UserId(2), now).unwrap();
        assert!(matches!(
            db.add_member(dm.id, UserId(3), now),
            Err(StoreError::Constraint(_))
        ));

        let group = db
            .create_group_thread(UserId(1), "Council", &[UserId(2)], now)
            .unwrap();
        db.add_member(group.id, UserId(3), now).unwrap();
        assert!(matches!(
            db.add_member(group.id, UserId(3), now),
            Err(StoreError::Constraint(_))
        ));
    }
}

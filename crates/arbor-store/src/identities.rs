//! CRUD operations for [`IdentityRecord`] rows.
//!
//! Writes are atomic across all four key fields plus the version bump: a
//! reader can never observe a new public key paired with an old encrypted
//! private key. That single-writer guarantee is what keeps every future
//! wrap/unwrap coherent after a rotation.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use arbor_shared::{Identity, PublicKey, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::IdentityRecord;

impl Database {
    /// Insert or wholesale-replace a user's identity, bumping the version.
    ///
    /// Returns the new identity version. `enabled_at` is preserved across
    /// rotations; `rotated_at` always moves to `now`.
    pub fn upsert_identity(
        &self,
        user_id: UserId,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let tx = self.conn().unchecked_transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT identity_version, enabled_at FROM identities WHERE user_id = ?1",
                params![user_id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (new_version, enabled_at) = match existing {
            Some((version, enabled_at)) => (version + 1, enabled_at),
            None => (1, now.to_rfc3339()),
        };

        tx.execute(
            "INSERT INTO identities
                 (user_id, public_key, encrypted_private_key, key_salt, key_nonce,
                  identity_version, enabled_at, rotated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                 public_key = excluded.public_key,
                 encrypted_private_key = excluded.encrypted_private_key,
                 key_salt = excluded.key_salt,
                 key_nonce = excluded.key_nonce,
                 identity_version = excluded.identity_version,
                 rotated_at = excluded.rotated_at",
            params![
                user_id.0,
                identity.public_key.as_bytes(),
                identity.encrypted_private_key,
                identity.salt.as_slice(),
                identity.nonce.as_slice(),
                new_version,
                enabled_at,
                now.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(new_version)
    }

    /// Fetch a user's identity row.
    pub fn get_identity(&self, user_id: UserId) -> Result<IdentityRecord> {
        let row: Option<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>, i64, String, String)> = self
            .conn()
            .query_row(
                "SELECT public_key, encrypted_private_key, key_salt, key_nonce,
                        identity_version, enabled_at, rotated_at
                 FROM identities WHERE user_id = ?1",
                params![user_id.0],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        let (public_key, encrypted_private_key, salt, nonce, version, enabled_at, rotated_at) =
            row.ok_or(StoreError::NotFound)?;

        let public_key = PublicKey::from_bytes(public_key)
            .map_err(|e| StoreError::Corrupt(format!("identity public key: {e}")))?;
        let salt: [u8; 16] = salt
            .try_into()
            .map_err(|_| StoreError::Corrupt("identity salt is not 16 bytes".into()))?;
        let nonce: [u8; 12] = nonce
            .try_into()
            .map_err(|_| StoreError::Corrupt("identity nonce is not 12 bytes".into()))?;

        Ok(IdentityRecord {
            user_id,
            identity: Identity {
                public_key,
                encrypted_private_key,
                salt,
                nonce,
            },
            identity_version: version,
            enabled_at: parse_timestamp(&enabled_at)?,
            rotated_at: parse_timestamp(&rotated_at)?,
        })
    }

    /// The current identity version for a user, or `None` when no identity
    /// has been provisioned.
    pub fn identity_version(&self, user_id: UserId) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT identity_version FROM identities WHERE user_id = ?1",
                params![user_id.0],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Whether the user has provisioned chat keys.
    pub fn has_identity(&self, user_id: UserId) -> Result<bool> {
        Ok(self.identity_version(user_id)?.is_some())
    }

    /// Public keys for a set of users, in input order. Users without an
    /// identity are simply absent from the result.
    pub fn public_keys_for(&self, user_ids: &[UserId]) -> Result<Vec<(UserId, PublicKey)>> {
        let mut keys = Vec::with_capacity(user_ids.len());
        let mut stmt = self
            .conn()
            .prepare("SELECT public_key FROM identities WHERE user_id = ?1")?;
        for user_id in user_ids {
            let blob: Option<Vec<u8>> = stmt
                .query_row(params![user_id.0], |row| row.get(0))
                .optional()?;
            if let Some(blob) = blob {
                let key = PublicKey::from_bytes(blob)
                    .map_err(|e| StoreError::Corrupt(format!("identity public key: {e}")))?;
                keys.push((*user_id, key));
            }
        }
        Ok(keys)
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_bumps_version_and_replaces_all_fields() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId(1);
        let now = Utc::now();

        let first = Identity::generate("p1").unwrap();
        assert_eq!(db.upsert_identity(user, &first, now).unwrap(), 1);

        let second = Identity::generate("p2").unwrap();
        assert_eq!(db.upsert_identity(user, &second, now).unwrap(), 2);

        let record = db.get_identity(user).unwrap();
        assert_eq!(record.identity_version, 2);
        assert_eq!(record.identity.public_key, second.public_key);
        assert_eq!(record.identity.salt, second.salt);
        // The replacement is wholesale: the new private key unlocks with
        // the new passphrase only.
        assert!(record.identity.unlock("p2").is_ok());
        assert!(record.identity.unlock("p1").is_err());
    }

    #[test]
    fn missing_identity_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_identity(UserId(404)),
            Err(StoreError::NotFound)
        ));
        assert_eq!(db.identity_version(UserId(404)).unwrap(), None);
        assert!(!db.has_identity(UserId(404)).unwrap());
    }

    #[test]
    fn public_keys_skip_users_without_keys() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let identity = Identity::generate("p1").unwrap();
        db.upsert_identity(UserId(1), &identity, now).unwrap();

        let keys = db.public_keys_for(&[UserId(1), UserId(2)]).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0, UserId(1));
        assert_eq!(keys[0].1, identity.public_key);
    }
}

//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbor_shared::{MessageId, ThreadId, ThreadKind, UserId};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A user's persisted identity row: public key plus the passphrase-encrypted
/// private key material, and the version counter bumped on every rotation.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub user_id: UserId,
    pub identity: arbor_shared::Identity,
    pub identity_version: i64,
    /// When chat keys were first provisioned for this user.
    pub enabled_at: DateTime<Utc>,
    /// When the current keypair was written (provisioning or rotation).
    pub rotated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Thread / membership
// ---------------------------------------------------------------------------

/// A conversation thread (DM or group).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thread {
    pub id: ThreadId,
    pub kind: ThreadKind,
    /// Group title; `None` for DMs.
    pub title: Option<String>,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn is_group(&self) -> bool {
        self.kind == ThreadKind::Group
    }
}

/// One user's membership in a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadMember {
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A stored message: one ciphertext shared by every recipient.
/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub body_ciphertext: Vec<u8>,
    pub body_nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// The message key wrapped for one recipient, plus that recipient's read
/// marker. Owned by the (message, user) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKeyRow {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub kem_ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub wrap_nonce: Vec<u8>,
    pub read_at: Option<DateTime<Utc>>,
}

/// A message joined with all of its per-recipient key rows, as loaded for
/// history rendering and broadcast.
#[derive(Debug, Clone)]
pub struct MessageWithKeys {
    pub message: StoredMessage,
    pub keys: Vec<MessageKeyRow>,
}

impl MessageWithKeys {
    /// The wrapped key addressed to `user`, if one exists.
    pub fn key_for(&self, user: UserId) -> Option<&MessageKeyRow> {
        self.keys.iter().find(|key| key.user_id == user)
    }
}

//! Chat orchestration: identity lifecycle, message fan-out, history
//! rendering and thread membership.
//!
//! This is the seam between the crypto core, the store and the realtime
//! registry. Plaintext exists only transiently inside these methods; what
//! gets persisted and broadcast is always ciphertext plus per-recipient
//! rendered payloads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use arbor_shared::codec::{self, Role};
use arbor_shared::protocol::{
    MessagePayload, ServerEvent, DECRYPT_FAILED_PLACEHOLDER, LOCKED_PLACEHOLDER,
};
use arbor_shared::{CryptoError, Identity, MessageId, PrivateKey, ThreadId, UserId, WrappedMessageKey};
use arbor_store::threads::MemberDeparture;
use arbor_store::{Database, MessageWithKeys, StoreError, Thread, ThreadMember};

use crate::error::ServerError;
use crate::registry::Registry;
use crate::session::SessionKeyCache;

/// Scope of a message deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    /// Remove only the caller's wrapped key (DM only); the message stays
    /// readable for the other side.
    SelfOnly,
    /// Remove the message for every member.
    All,
}

/// One thread as shown in the caller's thread list.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub display_name: String,
    pub preview: String,
    pub unread_count: i64,
    pub is_group: bool,
    pub owner_id: UserId,
    pub last_at: Option<DateTime<Utc>>,
}

/// A thread opened for one connection: metadata plus rendered history.
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub thread_id: ThreadId,
    pub display_name: String,
    pub is_group: bool,
    pub owner_id: UserId,
    pub messages: Vec<MessagePayload>,
}

/// Service object wiring the store, the session cache and the registry.
/// Constructed once at startup and cloned into handlers.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Mutex<Database>>,
    registry: Arc<Registry>,
    sessions: SessionKeyCache,
    max_message_length: usize,
}

impl ChatService {
    pub fn new(
        db: Arc<Mutex<Database>>,
        registry: Arc<Registry>,
        sessions: SessionKeyCache,
        max_message_length: usize,
    ) -> Self {
        Self {
            db,
            registry,
            sessions,
            max_message_length,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Identity lifecycle
    // ------------------------------------------------------------------

    /// Return the user's unlocked private key, provisioning an identity if
    /// none exists.
    ///
    /// On a failed unlock the behavior is explicit at the call site:
    /// `rotate_on_failure = true` replaces the identity wholesale (the
    /// login path, which avoids lockout at the documented cost of
    /// orphaning every previously wrapped key), `false` propagates the
    /// failure (explicit unlock UI, where silent rotation would be
    /// surprising).
    pub async fn ensure_identity(
        &self,
        user: UserId,
        passphrase: &str,
        rotate_on_failure: bool,
    ) -> Result<(PrivateKey, i64), ServerError> {
        let db = self.db.lock().await;
        match db.get_identity(user) {
            Ok(record) => match record.identity.unlock(passphrase) {
                Ok(private_key) => Ok((private_key, record.identity_version)),
                Err(CryptoError::Authentication) if rotate_on_failure => {
                    warn!(user = %user, "rotating chat keys after failed unlock");
                    provision_identity(&db, user, passphrase)
                }
                Err(err) => Err(err.into()),
            },
            Err(StoreError::NotFound) => provision_identity(&db, user, passphrase),
            Err(err) => Err(err.into()),
        }
    }

    /// Unlock a session: resolve the private key and cache it.
    pub async fn unlock_session(
        &self,
        user: UserId,
        session: Uuid,
        passphrase: &str,
        rotate_on_failure: bool,
    ) -> Result<(), ServerError> {
        let (private_key, version) = self
            .ensure_identity(user, passphrase, rotate_on_failure)
            .await?;
        self.sessions.store(session, private_key, version).await;
        Ok(())
    }

    /// Drop a session's cached key.
    pub async fn lock_session(&self, session: Uuid) {
        self.sessions.clear(session).await;
    }

    /// The session's cached private key, if still valid for the user's
    /// current identity version.
    pub async fn session_key(
        &self,
        user: UserId,
        session: Uuid,
    ) -> Result<Option<PrivateKey>, ServerError> {
        let version = {
            let db = self.db.lock().await;
            db.identity_version(user)?
        };
        Ok(self.sessions.get(session, version).await)
    }

    // ------------------------------------------------------------------
    // Sending and rendering
    // ------------------------------------------------------------------

    /// Encrypt, persist and broadcast one message.
    pub async fn send_message(
        &self,
        user: UserId,
        session: Uuid,
        thread_id: ThreadId,
        body: &str,
    ) -> Result<MessageId, ServerError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ServerError::BadRequest("message body is empty".into()));
        }
        if body.chars().count() > self.max_message_length {
            return Err(ServerError::BadRequest(format!(
                "messages are limited to {} characters",
                self.max_message_length
            )));
        }

        let (thread, members, member_keys, identity_version) = {
            let db = self.db.lock().await;
            let thread = db
                .get_thread(thread_id)
                .map_err(|_| ServerError::NotFound("thread".into()))?;
            let members = db.thread_members(thread_id)?;
            if !members.iter().any(|m| m.user_id == user) {
                return Err(ServerError::Membership);
            }
            let member_ids: Vec<UserId> = members.iter().map(|m| m.user_id).collect();
            let member_keys = db.public_keys_for(&member_ids)?;
            if member_keys.len() != member_ids.len() {
                return Err(ServerError::Configuration(
                    "every member must have provisioned chat keys".into(),
                ));
            }
            (thread, members, member_keys, db.identity_version(user)?)
        };

        if self.sessions.get(session, identity_version).await.is_none() {
            return Err(ServerError::Locked);
        }

        let sealed = codec::encrypt_for_thread(body, &member_keys, user)?;

        let loaded = {
            let db = self.db.lock().await;
            let message_id = db.insert_sealed_message(thread_id, user, &sealed, Utc::now())?;
            db.message_with_keys(message_id)?
        };
        let message_id = loaded.message.id;

        info!(thread = %thread_id, message = %message_id, sender = %user, "message stored");

        self.registry
            .broadcast(thread_id, |recipient| ServerEvent::Message {
                thread_id,
                message: render_message(
                    &thread,
                    &members,
                    &loaded,
                    recipient.user_id,
                    recipient.private_key.as_ref(),
                ),
            })
            .await;

        Ok(message_id)
    }

    /// Render a thread's full history for one connection, without touching
    /// read markers (the socket path).
    pub async fn thread_view(
        &self,
        user: UserId,
        thread_id: ThreadId,
        private_key: Option<&PrivateKey>,
    ) -> Result<ThreadView, ServerError> {
        let db = self.db.lock().await;
        let (thread, members) = membership_checked(&db, thread_id, user)?;
        let history = db.history_for_thread(thread_id)?;

        let messages = history
            .iter()
            .map(|entry| render_message(&thread, &members, entry, user, private_key))
            .collect();

        Ok(ThreadView {
            thread_id,
            display_name: display_name(&thread, &members, user),
            is_group: thread.is_group(),
            owner_id: thread.creator_id,
            messages,
        })
    }

    /// Thread metadata without history. Used for idempotent re-subscribes,
    /// which deliberately push an empty history delta.
    pub async fn thread_info(
        &self,
        user: UserId,
        thread_id: ThreadId,
    ) -> Result<ThreadView, ServerError> {
        let db = self.db.lock().await;
        let (thread, members) = membership_checked(&db, thread_id, user)?;
        Ok(ThreadView {
            thread_id,
            display_name: display_name(&thread, &members, user),
            is_group: thread.is_group(),
            owner_id: thread.creator_id,
            messages: Vec::new(),
        })
    }

    /// Render history for the HTTP read path, marking everything read when
    /// the caller holds a key.
    pub async fn collect_history(
        &self,
        user: UserId,
        session: Uuid,
        thread_id: ThreadId,
    ) -> Result<Vec<MessagePayload>, ServerError> {
        let private_key = self.session_key(user, session).await?;
        let view = self.thread_view(user, thread_id, private_key.as_ref()).await?;
        if private_key.is_some() {
            let db = self.db.lock().await;
            db.mark_thread_read(thread_id, user, Utc::now())?;
        }
        Ok(view.messages)
    }

    /// The caller's thread list with previews and unread counts, newest
    /// activity first.
    pub async fn thread_summaries(
        &self,
        user: UserId,
        session: Uuid,
    ) -> Result<Vec<ThreadSummary>, ServerError> {
        let private_key = self.session_key(user, session).await?;
        let db = self.db.lock().await;

        let threads = db.threads_for_user(user)?;
        let unread = db.unread_counts(user)?;

        let mut summaries = Vec::with_capacity(threads.len());
        for thread in threads {
            let members = db.thread_members(thread.id)?;
            let last = db.last_message_for_thread(thread.id)?;

            let (preview, last_at) = match &last {
                None => ("No messages yet.".to_string(), None),
                Some(entry) => {
                    let preview = match &private_key {
                        None => "Unlock to reveal the latest message.".to_string(),
                        Some(key) => {
                            render_message(&thread, &members, entry, user, Some(key)).body
                        }
                    };
                    (preview, Some(entry.message.created_at))
                }
            };

            summaries.push(ThreadSummary {
                thread_id: thread.id,
                display_name: display_name(&thread, &members, user),
                preview,
                unread_count: unread.get(&thread.id).copied().unwrap_or(0),
                is_group: thread.is_group(),
                owner_id: thread.creator_id,
                last_at,
            });
        }

        summaries.sort_by(|a, b| b.last_at.cmp(&a.last_at));
        Ok(summaries)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Delete a message, either for the caller alone (DM) or for everyone.
    /// Full deletions are broadcast to current subscribers.
    pub async fn delete_message(
        &self,
        user: UserId,
        message_id: MessageId,
        scope: DeleteScope,
    ) -> Result<(), ServerError> {
        let thread_id = {
            let db = self.db.lock().await;
            let loaded = db
                .message_with_keys(message_id)
                .map_err(|_| ServerError::NotFound("message".into()))?;
            let (thread, members) = membership_checked(&db, loaded.message.thread_id, user)?;

            match scope {
                DeleteScope::SelfOnly => {
                    if thread.is_group() {
                        return Err(ServerError::BadRequest(
                            "delete-for-me is only available in direct messages".into(),
                        ));
                    }
                    if !db.delete_key_for_user(message_id, user)? {
                        return Err(ServerError::NotFound("message key".into()));
                    }
                    return Ok(());
                }
                DeleteScope::All => {
                    if !can_delete(&thread, &members, &loaded, user) {
                        return Err(ServerError::Forbidden(
                            "only the sender or a group admin can remove a message".into(),
                        ));
                    }
                    db.delete_message(message_id)?;
                    thread.id
                }
            }
        };

        info!(message = %message_id, thread = %thread_id, by = %user, "message deleted");
        self.registry
            .broadcast_message_deleted(thread_id, message_id)
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Open (or find) the DM thread with `partner`.
    pub async fn start_dm(&self, user: UserId, partner: UserId) -> Result<Thread, ServerError> {
        if user == partner {
            return Err(ServerError::BadRequest(
                "choose someone else to start a direct message".into(),
            ));
        }
        let db = self.db.lock().await;
        if !db.has_identity(partner)? {
            return Err(ServerError::Configuration(
                "that member has not provisioned chat keys yet".into(),
            ));
        }
        Ok(db.get_or_create_dm_thread(user, partner, Utc::now())?)
    }

    /// Create a group thread. Every member must already hold chat keys.
    pub async fn create_group(
        &self,
        user: UserId,
        title: &str,
        member_ids: &[UserId],
    ) -> Result<Thread, ServerError> {
        let db = self.db.lock().await;
        let mut missing = Vec::new();
        for member in member_ids.iter().chain(std::iter::once(&user)) {
            if !db.has_identity(*member)? {
                missing.push(member.to_string());
            }
        }
        if !missing.is_empty() {
            return Err(ServerError::Configuration(format!(
                "these members must provision chat keys first: {}",
                missing.join(", ")
            )));
        }
        let title = if title.trim().is_empty() {
            "Group Room"
        } else {
            title.trim()
        };
        Ok(db.create_group_thread(user, title, member_ids, Utc::now())?)
    }

    /// Leave a group thread. The founder must delete instead.
    pub async fn leave_thread(&self, user: UserId, thread_id: ThreadId) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let (thread, _) = membership_checked(&db, thread_id, user)?;
        if !thread.is_group() {
            return Err(ServerError::BadRequest(
                "only group threads can be left".into(),
            ));
        }
        if thread.creator_id == user {
            return Err(ServerError::Forbidden(
                "the founder cannot leave; delete the group instead".into(),
            ));
        }
        let departure = db.remove_member(thread_id, user)?;
        if let MemberDeparture::LeftWithPromotion(promoted) = departure {
            info!(thread = %thread_id, user = %promoted, "promoted to group admin");
        }
        Ok(())
    }

    /// Remove `target` from a group. Founder only.
    pub async fn kick_member(
        &self,
        user: UserId,
        thread_id: ThreadId,
        target: UserId,
    ) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let (thread, _) = membership_checked(&db, thread_id, user)?;
        if !thread.is_group() {
            return Err(ServerError::BadRequest(
                "only group threads support removing members".into(),
            ));
        }
        if thread.creator_id != user {
            return Err(ServerError::Forbidden(
                "only the group founder can remove members".into(),
            ));
        }
        if target == user {
            return Err(ServerError::BadRequest(
                "the founder cannot remove themselves".into(),
            ));
        }
        match db.remove_member(thread_id, target) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound) => Err(ServerError::NotFound("membership".into())),
            Err(err) => Err(err.into()),
        }
    }

    /// Add a member to a group. Founder only; the newcomer needs keys.
    ///
    /// Joining grants future messages only: no wraps exist for messages
    /// sent before the join, and none are created retroactively.
    pub async fn add_member(
        &self,
        user: UserId,
        thread_id: ThreadId,
        new_member: UserId,
    ) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let (thread, _) = membership_checked(&db, thread_id, user)?;
        if !thread.is_group() {
            return Err(ServerError::BadRequest(
                "only group threads support adding members".into(),
            ));
        }
        if thread.creator_id != user {
            return Err(ServerError::Forbidden(
                "only the group founder can add members".into(),
            ));
        }
        if !db.has_identity(new_member)? {
            return Err(ServerError::Configuration(
                "that member has not provisioned chat keys yet".into(),
            ));
        }
        db.add_member(thread_id, new_member, Utc::now())?;
        Ok(())
    }

    /// Delete a thread. Groups: founder only, removed for everyone. DMs:
    /// the caller just leaves their side.
    pub async fn delete_thread(&self, user: UserId, thread_id: ThreadId) -> Result<(), ServerError> {
        let db = self.db.lock().await;
        let (thread, _) = membership_checked(&db, thread_id, user)?;
        if thread.is_group() {
            if thread.creator_id != user {
                return Err(ServerError::Forbidden(
                    "only the group founder can delete the group".into(),
                ));
            }
            db.delete_thread(thread_id)?;
        } else {
            db.remove_member(thread_id, user)?;
        }
        Ok(())
    }

    /// Whether `user` currently belongs to `thread_id`. Used by the socket
    /// path to authorize subscriptions.
    pub async fn is_member(&self, user: UserId, thread_id: ThreadId) -> Result<bool, ServerError> {
        let db = self.db.lock().await;
        match db.get_thread(thread_id) {
            Ok(_) => Ok(db.is_member(thread_id, user)?),
            Err(StoreError::NotFound) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering helpers
// ---------------------------------------------------------------------------

fn provision_identity(
    db: &Database,
    user: UserId,
    passphrase: &str,
) -> Result<(PrivateKey, i64), ServerError> {
    let identity = Identity::generate(passphrase)?;
    let version = db.upsert_identity(user, &identity, Utc::now())?;
    info!(
        user = %user,
        version,
        fingerprint = %identity.public_key.fingerprint(),
        "provisioned chat identity"
    );
    let private_key = identity.unlock(passphrase)?;
    Ok((private_key, version))
}

fn membership_checked(
    db: &Database,
    thread_id: ThreadId,
    user: UserId,
) -> Result<(Thread, Vec<ThreadMember>), ServerError> {
    let thread = db
        .get_thread(thread_id)
        .map_err(|_| ServerError::NotFound("thread".into()))?;
    let members = db.thread_members(thread_id)?;
    if !members.iter().any(|m| m.user_id == user) {
        return Err(ServerError::Membership);
    }
    Ok((thread, members))
}

fn display_name(thread: &Thread, members: &[ThreadMember], viewer: UserId) -> String {
    if thread.is_group() {
        return thread.title.clone().unwrap_or_else(|| "Group Room".into());
    }
    members
        .iter()
        .find(|m| m.user_id != viewer)
        .map(|m| format!("Direct with user {}", m.user_id))
        .unwrap_or_else(|| "Direct message".into())
}

fn can_delete(
    thread: &Thread,
    members: &[ThreadMember],
    message: &MessageWithKeys,
    user: UserId,
) -> bool {
    if message.message.sender_id == user {
        return true;
    }
    thread.is_group()
        && members
            .iter()
            .any(|m| m.user_id == user && m.is_admin)
}

/// Render one message for one viewer. A viewer without a cached key sees
/// the locked placeholder; a failed decrypt renders the fixed failure
/// placeholder and logs the message and user ids only.
pub(crate) fn render_message(
    thread: &Thread,
    members: &[ThreadMember],
    entry: &MessageWithKeys,
    viewer: UserId,
    private_key: Option<&PrivateKey>,
) -> MessagePayload {
    let message = &entry.message;
    let locked = private_key.is_none();

    let body = match private_key {
        None => LOCKED_PLACEHOLDER.to_string(),
        Some(key) => match decrypt_entry(entry, viewer, key) {
            Ok(body) => body,
            Err(_) => {
                warn!(
                    message = %message.id,
                    user = %viewer,
                    "failed to decrypt message for user"
                );
                DECRYPT_FAILED_PLACEHOLDER.to_string()
            }
        },
    };

    MessagePayload {
        id: message.id,
        body,
        created_at: message.created_at,
        created_label: message.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        sender_id: message.sender_id,
        is_self: message.sender_id == viewer,
        locked,
        can_delete: can_delete(thread, members, entry, viewer),
    }
}

fn decrypt_entry(
    entry: &MessageWithKeys,
    viewer: UserId,
    private_key: &PrivateKey,
) -> Result<String, ServerError> {
    let key_row = entry
        .key_for(viewer)
        .ok_or_else(|| ServerError::NotFound("message key".into()))?;
    let role = if entry.message.sender_id == viewer {
        Role::Sender
    } else {
        Role::Recipient
    };
    let nonce: [u8; 12] = key_row
        .wrap_nonce
        .clone()
        .try_into()
        .map_err(|_| ServerError::Internal("corrupt wrap nonce".into()))?;
    let wrapped = WrappedMessageKey {
        kem_ciphertext: key_row.kem_ciphertext.clone(),
        wrapped_key: key_row.wrapped_key.clone(),
        nonce,
    };
    Ok(codec::decrypt_for_user(
        &entry.message.body_nonce,
        &entry.message.body_ciphertext,
        &wrapped,
        private_key,
        role,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    async fn service() -> ChatService {
        let db = Database::open_in_memory().unwrap();
        ChatService::new(
            Arc::new(Mutex::new(db)),
            Arc::new(Registry::new()),
            SessionKeyCache::new(),
            arbor_shared::constants::MAX_MESSAGE_LENGTH,
        )
    }

    fn session() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn test_two_party_send_and_read() {
        let chat = service().await;
        let (alice, bob) = (UserId(1), UserId(2));
        let (alice_session, bob_session) = (session(), session());

        chat.unlock_session(alice, alice_session, "p1", true).await.unwrap();
        chat.unlock_session(bob, bob_session, "p2", true).await.unwrap();

        let thread = chat.start_dm(alice, bob).await.unwrap();
        let message_id = chat
            .send_message(alice, alice_session, thread.id, "Under the oak canopy.")
            .await
            .unwrap();

        // Exactly one wrap per member; the author's copy is born read.
        {
            let db = chat.db.lock().await;
            let loaded = db.message_with_keys(message_id).unwrap();
            assert_eq!(loaded.keys.len(), 2);
            assert!(loaded.key_for(alice).unwrap().read_at.is_some());
            assert!(loaded.key_for(bob).unwrap().read_at.is_none());
        }

        let history = chat
            .collect_history(bob, bob_session, thread.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "Under the oak canopy.");
        assert!(!history[0].is_self);

        // Reading with a key marks the row read.
        let db = chat.db.lock().await;
        let loaded = db.message_with_keys(message_id).unwrap();
        assert!(loaded.key_for(bob).unwrap().read_at.is_some());
    }

    #[tokio::test]
    async fn test_group_scenario_three_wraps_two_unread() {
        let chat = service().await;
        let users = [UserId(1), UserId(2), UserId(3)];
        let sessions = [session(), session(), session()];
        for (user, sess) in users.iter().zip(sessions.iter()) {
            chat.unlock_session(*user, *sess, "pass", true).await.unwrap();
        }

        let thread = chat
            .create_group(users[0], "Council", &users[1..])
            .await
            .unwrap();
        let message_id = chat
            .send_message(users[0], sessions[0], thread.id, "gathering at dusk")
            .await
            .unwrap();

        let db = chat.db.lock().await;
        let loaded = db.message_with_keys(message_id).unwrap();
        assert_eq!(loaded.keys.len(), 3);
        let unread = loaded.keys.iter().filter(|k| k.read_at.is_none()).count();
        assert_eq!(unread, 2);
    }

    #[tokio::test]
    async fn test_send_requires_membership_and_unlock() {
        let chat = service().await;
        let (alice, bob, mallory) = (UserId(1), UserId(2), UserId(3));
        let alice_session = session();

        chat.unlock_session(alice, alice_session, "p1", true).await.unwrap();
        chat.unlock_session(bob, session(), "p2", true).await.unwrap();
        chat.unlock_session(mallory, session(), "p3", true).await.unwrap();

        let thread = chat.start_dm(alice, bob).await.unwrap();

        let err = chat
            .send_message(mallory, session(), thread.id, "let me in")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Membership));

        // A member with no cached key is locked, not broken.
        let err = chat
            .send_message(bob, session(), thread.id, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Locked));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_propagates_without_rotation() {
        let chat = service().await;
        let alice = UserId(1);
        chat.unlock_session(alice, session(), "correct", true).await.unwrap();
        let version_before = {
            let db = chat.db.lock().await;
            db.identity_version(alice).unwrap().unwrap()
        };

        let err = chat
            .unlock_session(alice, session(), "wrong", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Authentication));

        let version_after = {
            let db = chat.db.lock().await;
            db.identity_version(alice).unwrap().unwrap()
        };
        assert_eq!(version_before, version_after);
    }

    #[tokio::test]
    async fn test_rotation_bumps_version_and_invalidates_sessions() {
        let chat = service().await;
        let (alice, bob) = (UserId(1), UserId(2));
        let old_session = session();

        chat.unlock_session(alice, old_session, "original", true).await.unwrap();
        chat.unlock_session(bob, session(), "p2", true).await.unwrap();

        let thread = chat.start_dm(alice, bob).await.unwrap();
        chat.send_message(alice, old_session, thread.id, "before rotation")
            .await
            .unwrap();

        // Login with a different passphrase, rotation allowed.
        let new_session = session();
        chat.unlock_session(alice, new_session, "forgotten", true)
            .await
            .unwrap();

        // The old session's cached key is version-stale now.
        assert!(chat.session_key(alice, old_session).await.unwrap().is_none());

        // Messages wrapped for the old public key are orphaned: they render
        // as the failure placeholder, not an error.
        let history = chat
            .collect_history(alice, new_session, thread.id)
            .await
            .unwrap();
        assert_eq!(history[0].body, DECRYPT_FAILED_PLACEHOLDER);

        // Bob's copy is untouched by Alice's rotation.
        let bob_session = session();
        chat.unlock_session(bob, bob_session, "p2", false).await.unwrap();
        let history = chat
            .collect_history(bob, bob_session, thread.id)
            .await
            .unwrap();
        assert_eq!(history[0].body, "before rotation");
    }

    #[tokio::test]
    async fn test_locked_history_renders_placeholders() {
        let chat = service().await;
        let (alice, bob) = (UserId(1), UserId(2));
        let alice_session = session();
        chat.unlock_session(alice, alice_session, "p1", true).await.unwrap();
        chat.unlock_session(bob, session(), "p2", true).await.unwrap();

        let thread = chat.start_dm(alice, bob).await.unwrap();
        chat.send_message(alice, alice_session, thread.id, "secret")
            .await
            .unwrap();

        // Bob never unlocked this session.
        let history = chat
            .collect_history(bob, session(), thread.id)
            .await
            .unwrap();
        assert_eq!(history[0].body, LOCKED_PLACEHOLDER);
        assert!(history[0].locked);

        let summaries = chat.thread_summaries(bob, session()).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].preview, "Unlock to reveal the latest message.");
        assert_eq!(summaries[0].unread_count, 1);
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let chat = service().await;
        let (alice, bob) = (UserId(1), UserId(2));
        let (alice_session, bob_session) = (session(), session());
        chat.unlock_session(alice, alice_session, "p1", true).await.unwrap();
        chat.unlock_session(bob, bob_session, "p2", true).await.unwrap();

        let thread = chat.start_dm(alice, bob).await.unwrap();
        let first = chat
            .send_message(alice, alice_session, thread.id, "one")
            .await
            .unwrap();
        let second = chat
            .send_message(alice, alice_session, thread.id, "two")
            .await
            .unwrap();

        // Bob cannot delete Alice's message for everyone.
        let err = chat
            .delete_message(bob, first, DeleteScope::All)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Forbidden(_)));

        // But he can drop his own key for it.
        chat.delete_message(bob, first, DeleteScope::SelfOnly)
            .await
            .unwrap();
        let history = chat
            .collect_history(bob, bob_session, thread.id)
            .await
            .unwrap();
        assert_eq!(history[0].body, DECRYPT_FAILED_PLACEHOLDER);

        // Alice still reads it fine.
        let history = chat
            .collect_history(alice, alice_session, thread.id)
            .await
            .unwrap();
        assert_eq!(history[0].body, "one");

        // The sender deletes for everyone.
        chat.delete_message(alice, second, DeleteScope::All)
            .await
            .unwrap();
        let history = chat
            .collect_history(alice, alice_session, thread.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_with_their_own_keys() {
        let chat = service().await;
        let (alice, bob) = (UserId(1), UserId(2));
        let (alice_session, bob_session) = (session(), session());
        chat.unlock_session(alice, alice_session, "p1", true).await.unwrap();
        chat.unlock_session(bob, bob_session, "p2", true).await.unwrap();
        let thread = chat.start_dm(alice, bob).await.unwrap();

        let bob_key = chat.session_key(bob, bob_session).await.unwrap();
        let registry = chat.registry().clone();
        let mut bob_conn = registry.register(bob, bob_key).await;
        let mut locked_conn = registry.register(bob, None).await;
        registry.subscribe(bob_conn.id, thread.id).await;
        registry.subscribe(locked_conn.id, thread.id).await;

        chat.send_message(alice, alice_session, thread.id, "to the grove")
            .await
            .unwrap();

        match bob_conn.events.recv().await.unwrap() {
            ServerEvent::Message { message, .. } => {
                assert_eq!(message.body, "to the grove");
                assert!(!message.locked);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match locked_conn.events.recv().await.unwrap() {
            ServerEvent::Message { message, .. } => {
                assert_eq!(message.body, LOCKED_PLACEHOLDER);
                assert!(message.locked);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_member_without_keys_blocks_send() {
        let chat = service().await;
        let (alice, bob) = (UserId(1), UserId(2));
        let alice_session = session();
        chat.unlock_session(alice, alice_session, "p1", true).await.unwrap();
        chat.unlock_session(bob, session(), "p2", true).await.unwrap();
        let thread = chat.start_dm(alice, bob).await.unwrap();

        // Simulate a member whose identity row disappeared.
        {
            let db = chat.db.lock().await;
            db.conn()
                .execute("DELETE FROM identities WHERE user_id = 2", [])
                .unwrap();
        }

        let err = chat
            .send_message(alice, alice_session, thread.id, "hello?")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_late_joiner_cannot_read_history() {
        let chat = service().await;
        let users = [UserId(1), UserId(2), UserId(3)];
        let sessions = [session(), session(), session()];
        for (user, sess) in users.iter().zip(sessions.iter()) {
            chat.unlock_session(*user, *sess, "pass", true).await.unwrap();
        }

        let thread = chat
            .create_group(users[0], "Council", &users[1..2])
            .await
            .unwrap();
        chat.send_message(users[0], sessions[0], thread.id, "early words")
            .await
            .unwrap();

        chat.add_member(users[0], thread.id, users[2]).await.unwrap();

        // The newcomer has no wrap for the old message.
        let history = chat
            .collect_history(users[2], sessions[2], thread.id)
            .await
            .unwrap();
        assert_eq!(history[0].body, DECRYPT_FAILED_PLACEHOLDER);

        // But receives future ones.
        chat.send_message(users[0], sessions[0], thread.id, "fresh words")
            .await
            .unwrap();
        let history = chat
            .collect_history(users[2], sessions[2], thread.id)
            .await
            .unwrap();
        assert_eq!(history[1].body, "fresh words");
    }
}

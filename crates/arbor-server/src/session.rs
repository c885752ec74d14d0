//! Per-session custody of unlocked private keys.
//!
//! The cache lives only in process memory: keys are never persisted or
//! logged, and a process restart empties it (every session simply comes
//! back locked). "No key cached" is an expected state, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use arbor_shared::PrivateKey;

struct CachedKey {
    private_key: PrivateKey,
    identity_version: i64,
}

/// Process-wide map from session id to that session's unlocked key.
#[derive(Clone, Default)]
pub struct SessionKeyCache {
    inner: Arc<RwLock<HashMap<Uuid, CachedKey>>>,
}

impl SessionKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the unlocked key for a session, tagged with the identity
    /// version it was unlocked from.
    pub async fn store(&self, session: Uuid, private_key: PrivateKey, identity_version: i64) {
        self.inner.write().await.insert(
            session,
            CachedKey {
                private_key,
                identity_version,
            },
        );
    }

    /// The cached key for a session, or `None` when nothing is cached or
    /// the identity was rotated since caching (the stale entry is evicted).
    pub async fn get(&self, session: Uuid, expected_version: Option<i64>) -> Option<PrivateKey> {
        {
            let cache = self.inner.read().await;
            let entry = cache.get(&session)?;
            match expected_version {
                Some(version) if version != entry.identity_version => {}
                _ => return Some(entry.private_key.clone()),
            }
        }
        // Version mismatch: the identity rotated underneath this session.
        self.inner.write().await.remove(&session);
        None
    }

    /// Drop a session's key (lock / logout).
    pub async fn clear(&self, session: Uuid) {
        self.inner.write().await.remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_shared::kem;

    fn key() -> PrivateKey {
        kem::generate_keypair().1
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let cache = SessionKeyCache::new();
        assert!(cache.get(Uuid::new_v4(), Some(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_store_get_clear() {
        let cache = SessionKeyCache::new();
        let session = Uuid::new_v4();
        let private_key = key();

        cache.store(session, private_key.clone(), 3).await;
        let got = cache.get(session, Some(3)).await.unwrap();
        assert_eq!(got.as_bytes(), private_key.as_bytes());

        cache.clear(session).await;
        assert!(cache.get(session, Some(3)).await.is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_evicts() {
        let cache = SessionKeyCache::new();
        let session = Uuid::new_v4();
        cache.store(session, key(), 1).await;

        // Identity rotated to version 2: the stale key is gone for good.
        assert!(cache.get(session, Some(2)).await.is_none());
        assert!(cache.get(session, Some(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_expected_version_still_returns_key() {
        let cache = SessionKeyCache::new();
        let session = Uuid::new_v4();
        cache.store(session, key(), 1).await;
        assert!(cache.get(session, None).await.is_some());
    }
}

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::constants::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
use crate::error::CryptoError;

// User / thread / message ids are assigned by the surrounding application
// (integer primary keys); the core only moves them around.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ThreadId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread flavor: one-to-one conversation or named group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Dm,
    Group,
}

impl ThreadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadKind::Dm => "dm",
            ThreadKind::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(ThreadKind::Dm),
            "group" => Some(ThreadKind::Group),
            _ => None,
        }
    }
}

/// ML-KEM-768 public key (1184 bytes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                what: "public key",
                expected: PUBLIC_KEY_SIZE,
                got: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex fingerprint for logs and key-comparison UIs: BLAKE3 of the
    /// key, truncated to 8 bytes.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        hex::encode(&hash.as_bytes()[..8])
    }
}

/// ML-KEM-768 secret key (2400 bytes). Zeroized on drop; never printed.
#[derive(Clone)]
pub struct PrivateKey(Zeroizing<Vec<u8>>);

impl PrivateKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                what: "private key",
                expected: PRIVATE_KEY_SIZE,
                got: bytes.len(),
            });
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_length_enforced() {
        assert!(PublicKey::from_bytes(vec![0u8; PUBLIC_KEY_SIZE]).is_ok());
        assert!(PublicKey::from_bytes(vec![0u8; 32]).is_err());
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let key = PrivateKey::from_bytes(vec![7u8; PRIVATE_KEY_SIZE]).unwrap();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains('7'));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = PublicKey::from_bytes(vec![1u8; PUBLIC_KEY_SIZE]).unwrap();
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_eq!(key.fingerprint().len(), 16);
    }

    #[test]
    fn test_thread_kind_roundtrip() {
        assert_eq!(ThreadKind::parse("dm"), Some(ThreadKind::Dm));
        assert_eq!(ThreadKind::parse("group"), Some(ThreadKind::Group));
        assert_eq!(ThreadKind::parse("broadcast"), None);
        assert_eq!(ThreadKind::Group.as_str(), "group");
    }
}

//! Long-term user identities.
//!
//! Each user holds one ML-KEM-768 keypair. The private half is only ever
//! stored encrypted under a key derived from the user's passphrase; the
//! plaintext key exists in memory for the duration of a session and is
//! zeroized on drop.
//!
//! Rotation policy: an identity is superseded wholesale (all four fields
//! replaced together) and the owning row's identity-version counter is
//! bumped so stale cached session keys can be detected. Persisting that
//! atomically is the store's job; this module only produces the material.

use crate::aead;
use crate::constants::{NONCE_SIZE, SALT_SIZE};
use crate::error::CryptoError;
use crate::kdf;
use crate::kem;
use crate::types::{PrivateKey, PublicKey};

/// A user's long-term keypair, private half encrypted at rest.
#[derive(Debug, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub encrypted_private_key: Vec<u8>,
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
}

impl Identity {
    /// Create a new keypair and lock the private key under `passphrase`.
    pub fn generate(passphrase: &str) -> Result<Self, CryptoError> {
        let (public_key, private_key) = kem::generate_keypair();
        let salt = kdf::generate_salt();
        let nonce = aead::generate_nonce();
        let passphrase_key = kdf::derive_passphrase_key(passphrase, &salt);
        let encrypted_private_key =
            aead::seal(&passphrase_key, &nonce, private_key.as_bytes(), &[])?;
        Ok(Self {
            public_key,
            encrypted_private_key,
            salt,
            nonce,
        })
    }

    /// Decrypt the private key.
    ///
    /// Fails with [`CryptoError::Authentication`] when the passphrase is
    /// wrong or the record has been corrupted; it never silently yields
    /// wrong bytes.
    pub fn unlock(&self, passphrase: &str) -> Result<PrivateKey, CryptoError> {
        unlock_private_key(
            &self.encrypted_private_key,
            &self.salt,
            &self.nonce,
            passphrase,
        )
    }
}

/// Decrypt an encrypted private key from its stored components. Exposed
/// separately so callers holding only the encrypted blob (no public key)
/// can unlock it.
pub fn unlock_private_key(
    encrypted_private_key: &[u8],
    salt: &[u8; SALT_SIZE],
    nonce: &[u8; NONCE_SIZE],
    passphrase: &str,
) -> Result<PrivateKey, CryptoError> {
    let passphrase_key = kdf::derive_passphrase_key(passphrase, salt);
    let plaintext = aead::open(&passphrase_key, nonce, encrypted_private_key, &[])
        .map_err(|_| CryptoError::Authentication)?;
    PrivateKey::from_bytes(plaintext.to_vec())
}

//! Key derivation functions.
//!
//! `derive_passphrase_key` -- PBKDF2-HMAC-SHA256, 200k iterations; derives
//!   the 32-byte key that encrypts a user's private key at rest.
//!
//! `derive_wrap_key` -- HKDF-SHA256, single expand step; derives the
//!   32-byte key that wraps a per-message key for one recipient.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::constants::{PASS_KDF_ITERATIONS, SALT_SIZE};
use crate::error::CryptoError;

/// Generate a fresh random salt for a new passphrase key.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte key from a passphrase + salt. Deterministic: the same
/// inputs always yield the same key.
pub fn derive_passphrase_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PASS_KDF_ITERATIONS, &mut *key);
    key
}

/// Expand a KEM shared secret into a wrap key, domain-separated by `info`
/// so sender-role and recipient-role wraps are unlinkable.
pub fn derive_wrap_key(
    shared_secret: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut *key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

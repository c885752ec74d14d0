//! Authenticated encryption with associated data.
//!
//! ChaCha20-Poly1305, 32-byte keys, 12-byte random nonces. Nonces are
//! returned to the caller rather than prepended because the surrounding
//! data model persists them as separate fields. A fresh nonce must be
//! drawn for every call; never reuse one under the same key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::constants::NONCE_SIZE;
use crate::error::CryptoError;

/// Draw a fresh random 12-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and verify. Any tampering with the ciphertext, the nonce or the
/// associated data fails with [`CryptoError::Decryption`].
pub fn open(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidLength {
            what: "nonce",
            expected: NONCE_SIZE,
            got: nonce.len(),
        });
    }
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        let mut k = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut k);
        k
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = key();
        let nonce = generate_nonce();
        let sealed = seal(&key, &nonce, b"a quiet clearing", b"ctx").unwrap();
        let opened = open(&key, &nonce, &sealed, b"ctx").unwrap();
        assert_eq!(&*opened, b"a quiet clearing");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = key();
        let nonce = generate_nonce();
        let sealed = seal(&key, &nonce, b"payload", b"one").unwrap();
        assert!(open(&key, &nonce, &sealed, b"two").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = key();
        let nonce = generate_nonce();
        let mut sealed = seal(&key, &nonce, b"payload", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &nonce, &sealed, b"").is_err());
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let key = key();
        let err = open(&key, &[0u8; 8], b"whatever", b"").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidLength { .. }));
    }
}

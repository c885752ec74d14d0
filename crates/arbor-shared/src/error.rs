use thiserror::Error;

/// Errors produced by the cryptographic layer.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Wrong passphrase, or a corrupted identity record. The only expected
    /// failure mode of an unlock; retrying with the same passphrase cannot
    /// succeed.
    #[error("Authentication failed: wrong passphrase or corrupted identity")]
    Authentication,

    /// Malformed or mismatched KEM key / ciphertext material.
    #[error("Decapsulation failed: malformed key or ciphertext")]
    Decapsulation,

    /// AEAD tag verification failed, or the ciphertext is malformed. The
    /// caller renders a placeholder; it must never guess alternate keys.
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    Decryption,

    #[error("Encryption failed")]
    Encryption,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

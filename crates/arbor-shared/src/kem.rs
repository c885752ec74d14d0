//! ML-KEM-768 key encapsulation.
//!
//! Byte contracts (NIST Level 3 parameter set):
//! public key 1184, secret key 2400, ciphertext 1088, shared secret 32.

use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertext, PublicKey as KemPublicKey, SecretKey as KemSecretKey,
    SharedSecret as KemSharedSecret,
};
use zeroize::Zeroizing;

use crate::constants::{KEM_CIPHERTEXT_SIZE, SHARED_SECRET_SIZE};
use crate::error::CryptoError;
use crate::types::{PrivateKey, PublicKey};

/// Generate a fresh ML-KEM-768 keypair.
pub fn generate_keypair() -> (PublicKey, PrivateKey) {
    let (pk, sk) = mlkem768::keypair();
    let public = PublicKey::from_bytes(pk.as_bytes().to_vec())
        .expect("mlkem768 emits fixed-size public keys");
    let private = PrivateKey::from_bytes(sk.as_bytes().to_vec())
        .expect("mlkem768 emits fixed-size secret keys");
    (public, private)
}

/// Encapsulate a fresh shared secret against `public_key`.
///
/// Returns the 1088-byte KEM ciphertext and the 32-byte shared secret.
pub fn encapsulate(
    public_key: &PublicKey,
) -> Result<(Vec<u8>, Zeroizing<[u8; SHARED_SECRET_SIZE]>), CryptoError> {
    let pk = mlkem768::PublicKey::from_bytes(public_key.as_bytes())
        .map_err(|_| CryptoError::Decapsulation)?;
    let (ss, ct) = mlkem768::encapsulate(&pk);
    Ok((ct.as_bytes().to_vec(), copy_shared_secret(ss.as_bytes())?))
}

/// Recover the shared secret from a KEM ciphertext.
pub fn decapsulate(
    private_key: &PrivateKey,
    kem_ciphertext: &[u8],
) -> Result<Zeroizing<[u8; SHARED_SECRET_SIZE]>, CryptoError> {
    if kem_ciphertext.len() != KEM_CIPHERTEXT_SIZE {
        return Err(CryptoError::InvalidLength {
            what: "KEM ciphertext",
            expected: KEM_CIPHERTEXT_SIZE,
            got: kem_ciphertext.len(),
        });
    }
    let sk = mlkem768::SecretKey::from_bytes(private_key.as_bytes())
        .map_err(|_| CryptoError::Decapsulation)?;
    let ct = mlkem768::Ciphertext::from_bytes(kem_ciphertext)
        .map_err(|_| CryptoError::Decapsulation)?;
    let ss = mlkem768::decapsulate(&ct, &sk);
    copy_shared_secret(ss.as_bytes())
}

fn copy_shared_secret(
    bytes: &[u8],
) -> Result<Zeroizing<[u8; SHARED_SECRET_SIZE]>, CryptoError> {
    if bytes.len() != SHARED_SECRET_SIZE {
        return Err(CryptoError::Decapsulation);
    }
    let mut out = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
    out.copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

    #[test]
    fn test_keypair_sizes() {
        let (public, private) = generate_keypair();
        assert_eq!(public.as_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(private.as_bytes().len(), PRIVATE_KEY_SIZE);
    }

    #[test]
    fn test_encapsulate_decapsulate_roundtrip() {
        let (public, private) = generate_keypair();
        let (ciphertext, secret) = encapsulate(&public).unwrap();

        assert_eq!(ciphertext.len(), KEM_CIPHERTEXT_SIZE);
        let recovered = decapsulate(&private, &ciphertext).unwrap();
        assert_eq!(*recovered, *secret);
    }

    #[test]
    fn test_mismatched_key_yields_different_secret() {
        let (public_a, _) = generate_keypair();
        let (_, private_b) = generate_keypair();

        let (ciphertext, secret) = encapsulate(&public_a).unwrap();
        // ML-KEM implicit rejection: decapsulation with the wrong key
        // succeeds but produces an unrelated secret.
        let recovered = decapsulate(&private_b, &ciphertext).unwrap();
        assert_ne!(*recovered, *secret);
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let (_, private) = generate_keypair();
        let err = decapsulate(&private, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidLength { .. }));
    }
}

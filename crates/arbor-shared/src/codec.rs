//! Message encryption and per-recipient key wrapping.
//!
//! Sending encrypts the body once under a random 32-byte message key, then
//! wraps that key for every current thread member, sender included, by
//! encapsulating against the member's public key and sealing the message
//! key under an HKDF-expanded wrap key. The wrap set is a snapshot taken at
//! send time: members added later do not gain access to prior messages.

use std::collections::HashMap;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::aead;
use crate::constants::{
    BODY_AAD, MESSAGE_KEY_SIZE, NONCE_SIZE, WRAP_INFO_RECIPIENT, WRAP_INFO_SENDER,
};
use crate::error::CryptoError;
use crate::kdf;
use crate::kem;
use crate::types::{PrivateKey, PublicKey, UserId};

/// Which side of a wrap a blob was produced for. The role selects the HKDF
/// info and the wrap AAD, so a sender-role blob can never be opened as a
/// recipient-role blob or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Recipient,
}

impl Role {
    pub fn for_member(member: UserId, sender: UserId) -> Self {
        if member == sender {
            Role::Sender
        } else {
            Role::Recipient
        }
    }

    pub fn wrap_info(&self) -> &'static [u8] {
        match self {
            Role::Sender => WRAP_INFO_SENDER,
            Role::Recipient => WRAP_INFO_RECIPIENT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Recipient => "recipient",
        }
    }
}

/// One message's symmetric key, wrapped for exactly one recipient.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedMessageKey {
    pub kem_ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// The full output of encrypting one message for a thread: a single body
/// ciphertext plus one wrap per member, keyed by user id.
#[derive(Debug)]
pub struct SealedMessage {
    pub body_nonce: [u8; NONCE_SIZE],
    pub body_ciphertext: Vec<u8>,
    pub wraps: HashMap<UserId, WrappedMessageKey>,
}

/// Draw a fresh random per-message key.
pub fn generate_message_key() -> Zeroizing<[u8; MESSAGE_KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; MESSAGE_KEY_SIZE]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    key
}

/// Wrap `message_key` for the holder of `public_key` in the given role.
pub fn wrap_message_key(
    public_key: &PublicKey,
    message_key: &[u8; MESSAGE_KEY_SIZE],
    role: Role,
) -> Result<WrappedMessageKey, CryptoError> {
    let (kem_ciphertext, shared_secret) = kem::encapsulate(public_key)?;
    let wrap_key = kdf::derive_wrap_key(&*shared_secret, role.wrap_info())?;
    let nonce = aead::generate_nonce();
    let wrapped_key = aead::seal(&wrap_key, &nonce, message_key, role.wrap_info())?;
    Ok(WrappedMessageKey {
        kem_ciphertext,
        wrapped_key,
        nonce,
    })
}

/// Recover the message key from a wrap addressed to `private_key`'s holder.
pub fn unwrap_message_key(
    private_key: &PrivateKey,
    wrapped: &WrappedMessageKey,
    role: Role,
) -> Result<Zeroizing<[u8; MESSAGE_KEY_SIZE]>, CryptoError> {
    let shared_secret = kem::decapsulate(private_key, &wrapped.kem_ciphertext)?;
    let wrap_key = kdf::derive_wrap_key(&*shared_secret, role.wrap_info())?;
    let plaintext = aead::open(
        &wrap_key,
        &wrapped.nonce,
        &wrapped.wrapped_key,
        role.wrap_info(),
    )?;
    if plaintext.len() != MESSAGE_KEY_SIZE {
        return Err(CryptoError::Decryption);
    }
    let mut key = Zeroizing::new([0u8; MESSAGE_KEY_SIZE]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

/// Encrypt a message body under a message key.
pub fn encrypt_body(
    message_key: &[u8; MESSAGE_KEY_SIZE],
    plaintext: &str,
) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
    let nonce = aead::generate_nonce();
    let ciphertext = aead::seal(message_key, &nonce, plaintext.as_bytes(), BODY_AAD)?;
    Ok((nonce, ciphertext))
}

/// Decrypt a previously encrypted message body.
pub fn decrypt_body(
    message_key: &[u8; MESSAGE_KEY_SIZE],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<String, CryptoError> {
    let plaintext = aead::open(message_key, nonce, ciphertext, BODY_AAD)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Decryption)
}

/// Encrypt `plaintext` once and wrap the message key for every member.
///
/// Produces exactly one wrap per distinct member id; the entry for
/// `sender` carries the sender role, all others the recipient role.
pub fn encrypt_for_thread(
    plaintext: &str,
    members: &[(UserId, PublicKey)],
    sender: UserId,
) -> Result<SealedMessage, CryptoError> {
    let message_key = generate_message_key();
    let (body_nonce, body_ciphertext) = encrypt_body(&message_key, plaintext)?;

    let mut wraps = HashMap::with_capacity(members.len());
    for (user_id, public_key) in members {
        let role = Role::for_member(*user_id, sender);
        let wrapped = wrap_message_key(public_key, &message_key, role)?;
        wraps.insert(*user_id, wrapped);
    }

    Ok(SealedMessage {
        body_nonce,
        body_ciphertext,
        wraps,
    })
}

/// Recover the plaintext of one message for one user.
///
/// Every failure (decapsulation, unwrap, body decryption) surfaces as
/// [`CryptoError`]; callers render a fixed placeholder instead of the body
/// and must not retry with the same inputs.
pub fn decrypt_for_user(
    body_nonce: &[u8],
    body_ciphertext: &[u8],
    wrapped: &WrappedMessageKey,
    private_key: &PrivateKey,
    role: Role,
) -> Result<String, CryptoError> {
    let message_key = unwrap_message_key(private_key, wrapped, role)?;
    decrypt_body(&message_key, body_nonce, body_ciphertext)
}

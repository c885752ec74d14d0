//! # arbor-shared
//!
//! Cryptographic core and wire types for the Arbor encrypted messaging
//! system.
//!
//! Every message in a thread is encrypted once with a random 32-byte key,
//! and that key is wrapped (ML-KEM-768 encapsulation + ChaCha20-Poly1305)
//! individually for every thread member, sender included. The server only
//! ever handles ciphertext and wrapped-key blobs.

pub mod aead;
pub mod codec;
pub mod constants;
pub mod identity;
pub mod kdf;
pub mod kem;
pub mod protocol;
pub mod types;

mod error;

pub use codec::{Role, SealedMessage, WrappedMessageKey};
pub use error::CryptoError;
pub use identity::Identity;
pub use types::{MessageId, PrivateKey, PublicKey, ThreadId, ThreadKind, UserId};

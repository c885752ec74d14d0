/// ML-KEM-768 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1184;

/// ML-KEM-768 secret key size in bytes.
pub const PRIVATE_KEY_SIZE: usize = 2400;

/// ML-KEM-768 ciphertext size in bytes.
pub const KEM_CIPHERTEXT_SIZE: usize = 1088;

/// KEM shared secret size in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Per-message symmetric key size in bytes.
pub const MESSAGE_KEY_SIZE: usize = 32;

/// Passphrase KDF salt size in bytes.
pub const SALT_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 iteration count for passphrase keys.
pub const PASS_KDF_ITERATIONS: u32 = 200_000;

/// Associated data authenticated with every message body.
pub const BODY_AAD: &[u8] = b"arbor-chat-body-v1";

/// Domain tag for message-key wraps addressed to the sender's own copy.
pub const WRAP_INFO_SENDER: &[u8] = b"arbor-wrap-sender-v1";

/// Domain tag for message-key wraps addressed to a recipient.
pub const WRAP_INFO_RECIPIENT: &[u8] = b"arbor-wrap-recipient-v1";

/// Maximum plaintext message length in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4000;

/// Maximum number of members in a group thread.
pub const GROUP_MEMBER_LIMIT: usize = 16;

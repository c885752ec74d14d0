//! REST exposure of the raw KEM primitives.
//!
//! Every mutating endpoint is gated by an `X-API-Key` header checked in
//! constant time against the configured key set; unauthenticated callers
//! never reach the primitives. With no keys configured the gate is open
//! (development mode). Byte fields travel base64-encoded.

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

use arbor_shared::constants::{
    KEM_CIPHERTEXT_SIZE, NONCE_SIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SALT_SIZE,
    SHARED_SECRET_SIZE,
};
use arbor_shared::{codec, identity, kem};
use arbor_shared::{Identity, PrivateKey, PublicKey, Role, WrappedMessageKey};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::error::ServerError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/info", get(info))
        .route("/keypair/generate", post(generate_keypair))
        .route("/keypair/unlock", post(unlock_keypair))
        .route("/encapsulate", post(encapsulate))
        .route("/decapsulate", post(decapsulate))
        .route("/encrypt", post(encrypt_message))
        .route("/decrypt", post(decrypt_message))
}

fn enforce_api_key(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    if config.kem_api_keys.is_empty() {
        return Ok(());
    }

    let supplied = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    // Constant-time comparison against every configured key.
    let supplied_bytes = supplied.as_bytes();
    let authorized = config.kem_api_keys.iter().any(|key| {
        let expected = key.as_bytes();
        expected.len() == supplied_bytes.len()
            && expected.ct_eq(supplied_bytes).unwrap_u8() == 1
    });

    if !authorized {
        warn!("rejected KEM API request with missing or invalid API key");
        return Err(ServerError::Unauthorized);
    }
    Ok(())
}

fn b64(data: &[u8]) -> String {
    B64.encode(data)
}

fn b64_decode(field: &'static str, data: &str) -> Result<Vec<u8>, ServerError> {
    B64.decode(data)
        .map_err(|_| ServerError::BadRequest(format!("invalid base64 in {field}")))
}

fn fixed<const N: usize>(field: &'static str, bytes: Vec<u8>) -> Result<[u8; N], ServerError> {
    bytes
        .try_into()
        .map_err(|_| ServerError::BadRequest(format!("{field} must be {N} bytes")))
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct InfoResponse {
    algorithm: &'static str,
    description: &'static str,
    public_key_size: usize,
    private_key_size: usize,
    ciphertext_size: usize,
    shared_secret_size: usize,
    security_level: &'static str,
    version: &'static str,
}

#[derive(Deserialize, Default)]
struct GenerateRequest {
    passphrase: Option<String>,
}

#[derive(Serialize)]
struct GenerateResponse {
    public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encrypted_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    encrypted: bool,
}

#[derive(Deserialize)]
struct UnlockRequest {
    encrypted_private_key: String,
    salt: String,
    nonce: String,
    passphrase: String,
}

#[derive(Serialize)]
struct UnlockResponse {
    private_key: String,
}

#[derive(Deserialize)]
struct EncapsulateRequest {
    public_key: String,
}

#[derive(Serialize)]
struct EncapsulateResponse {
    ciphertext: String,
    shared_secret: String,
}

#[derive(Deserialize)]
struct DecapsulateRequest {
    private_key: String,
    ciphertext: String,
}

#[derive(Serialize)]
struct DecapsulateResponse {
    shared_secret: String,
}

#[derive(Deserialize)]
struct EncryptRequest {
    recipient_public_key: String,
    plaintext: String,
}

#[derive(Serialize)]
struct EncryptResponse {
    kem_ciphertext: String,
    wrapped_key: String,
    wrap_nonce: String,
    body_nonce: String,
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptRequest {
    private_key: String,
    kem_ciphertext: String,
    wrapped_key: String,
    wrap_nonce: String,
    body_nonce: String,
    ciphertext: String,
}

#[derive(Serialize)]
struct DecryptResponse {
    plaintext: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn info() -> Json<InfoResponse> {
    Json(InfoResponse {
        algorithm: "ML-KEM-768",
        description: "NIST-standardized post-quantum key encapsulation mechanism",
        public_key_size: PUBLIC_KEY_SIZE,
        private_key_size: PRIVATE_KEY_SIZE,
        ciphertext_size: KEM_CIPHERTEXT_SIZE,
        shared_secret_size: SHARED_SECRET_SIZE,
        security_level: "NIST Level 3 (equivalent to AES-192)",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn generate_keypair(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServerError> {
    enforce_api_key(&headers, &state.config)?;

    match req.passphrase.as_deref().filter(|p| !p.is_empty()) {
        Some(passphrase) => {
            let identity = Identity::generate(passphrase)?;
            Ok(Json(GenerateResponse {
                public_key: b64(identity.public_key.as_bytes()),
                private_key: None,
                encrypted_private_key: Some(b64(&identity.encrypted_private_key)),
                salt: Some(b64(&identity.salt)),
                nonce: Some(b64(&identity.nonce)),
                encrypted: true,
            }))
        }
        None => {
            let (public_key, private_key) = kem::generate_keypair();
            Ok(Json(GenerateResponse {
                public_key: b64(public_key.as_bytes()),
                private_key: Some(b64(private_key.as_bytes())),
                encrypted_private_key: None,
                salt: None,
                nonce: None,
                encrypted: false,
            }))
        }
    }
}

async fn unlock_keypair(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UnlockRequest>,
) -> Result<Json<UnlockResponse>, ServerError> {
    enforce_api_key(&headers, &state.config)?;

    if req.passphrase.is_empty() {
        return Err(ServerError::BadRequest("passphrase is required".into()));
    }

    let encrypted = b64_decode("encrypted_private_key", &req.encrypted_private_key)?;
    let salt: [u8; SALT_SIZE] = fixed("salt", b64_decode("salt", &req.salt)?)?;
    let nonce: [u8; NONCE_SIZE] = fixed("nonce", b64_decode("nonce", &req.nonce)?)?;

    let private_key =
        identity::unlock_private_key(&encrypted, &salt, &nonce, &req.passphrase)?;

    Ok(Json(UnlockResponse {
        private_key: b64(private_key.as_bytes()),
    }))
}

async fn encapsulate(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<EncapsulateRequest>,
) -> Result<Json<EncapsulateResponse>, ServerError> {
    enforce_api_key(&headers, &state.config)?;

    let public_key = PublicKey::from_bytes(b64_decode("public_key", &req.public_key)?)?;
    let (ciphertext, shared_secret) = kem::encapsulate(&public_key)?;

    Ok(Json(EncapsulateResponse {
        ciphertext: b64(&ciphertext),
        shared_secret: b64(&*shared_secret),
    }))
}

async fn decapsulate(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<DecapsulateRequest>,
) -> Result<Json<DecapsulateResponse>, ServerError> {
    enforce_api_key(&headers, &state.config)?;

    let private_key = PrivateKey::from_bytes(b64_decode("private_key", &req.private_key)?)?;
    let ciphertext = b64_decode("ciphertext", &req.ciphertext)?;
    let shared_secret = kem::decapsulate(&private_key, &ciphertext)?;

    Ok(Json(DecapsulateResponse {
        shared_secret: b64(&*shared_secret),
    }))
}

async fn encrypt_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<EncryptRequest>,
) -> Result<Json<EncryptResponse>, ServerError> {
    enforce_api_key(&headers, &state.config)?;

    if req.plaintext.is_empty() {
        return Err(ServerError::BadRequest("plaintext is required".into()));
    }
    let public_key =
        PublicKey::from_bytes(b64_decode("recipient_public_key", &req.recipient_public_key)?)?;

    let message_key = codec::generate_message_key();
    let wrapped = codec::wrap_message_key(&public_key, &message_key, Role::Recipient)?;
    let (body_nonce, ciphertext) = codec::encrypt_body(&message_key, &req.plaintext)?;

    Ok(Json(EncryptResponse {
        kem_ciphertext: b64(&wrapped.kem_ciphertext),
        wrapped_key: b64(&wrapped.wrapped_key),
        wrap_nonce: b64(&wrapped.nonce),
        body_nonce: b64(&body_nonce),
        ciphertext: b64(&ciphertext),
    }))
}

async fn decrypt_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<DecryptRequest>,
) -> Result<Json<DecryptResponse>, ServerError> {
    enforce_api_key(&headers, &state.config)?;

    let private_key = PrivateKey::from_bytes(b64_decode("private_key", &req.private_key)?)?;
    let wrapped = WrappedMessageKey {
        kem_ciphertext: b64_decode("kem_ciphertext", &req.kem_ciphertext)?,
        wrapped_key: b64_decode("wrapped_key", &req.wrapped_key)?,
        nonce: fixed("wrap_nonce", b64_decode("wrap_nonce", &req.wrap_nonce)?)?,
    };
    let body_nonce = b64_decode("body_nonce", &req.body_nonce)?;
    let ciphertext = b64_decode("ciphertext", &req.ciphertext)?;

    let message_key = codec::unwrap_message_key(&private_key, &wrapped, Role::Recipient)?;
    let plaintext = codec::decrypt_body(&message_key, &body_nonce, &ciphertext)?;

    Ok(Json(DecryptResponse { plaintext }))
}

// Decryption failures surface as 400s here (the caller supplied the key
// material); they are never retried server-side.

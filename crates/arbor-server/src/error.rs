use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use arbor_shared::CryptoError;
use arbor_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Missing or invalid caller credentials (auth headers, API key).
    #[error("Unauthorized")]
    Unauthorized,

    /// Wrong passphrase on an explicit unlock.
    #[error("Authentication failed: wrong passphrase")]
    Authentication,

    /// The caller is not a member of the thread they addressed. Never
    /// downgraded to a read-only view.
    #[error("Not a member of that thread")]
    Membership,

    /// The session holds no cached private key.
    #[error("Session is locked: unlock encrypted chat first")]
    Locked,

    /// Missing or invalid key material for an operation (e.g. a thread
    /// member without provisioned keys).
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Authentication => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Membership => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Locked => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Configuration(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("record not found".into()),
            StoreError::Constraint(msg) => ServerError::BadRequest(msg),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for ServerError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => ServerError::Authentication,
            CryptoError::InvalidLength { .. } => ServerError::BadRequest(err.to_string()),
            CryptoError::Decapsulation | CryptoError::Decryption => {
                ServerError::BadRequest(err.to_string())
            }
            other => ServerError::Internal(other.to_string()),
        }
    }
}

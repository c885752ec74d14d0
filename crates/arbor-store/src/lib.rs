//! # arbor-store
//!
//! SQLite persistence for the Arbor messaging core: long-term identities
//! (private halves encrypted at rest), threads and memberships, message
//! ciphertexts and the per-recipient wrapped-key rows that accompany them.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed CRUD helpers. Nothing in here ever
//! sees a plaintext message body or an unwrapped message key.

pub mod database;
pub mod identities;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod threads;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;

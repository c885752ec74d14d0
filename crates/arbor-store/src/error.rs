use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// A stored blob no longer matches its expected shape (e.g. a salt or
    /// nonce column of the wrong length).
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A membership or sizing rule was violated (group limits, duplicate
    /// members, operations on threads of the wrong kind).
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timestamp parse error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

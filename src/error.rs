use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database not open")]
    NotOpen,

    #[error("Database directory {path:?} is locked by another process")]
    AlreadyOpen { path: PathBuf },

    #[error("Database was opened read-only")]
    ReadOnly,

    #[error("Invalid file ID {0}")]
    InvalidFileId(u64),

    #[error("Corrupt record in file {file_id} at offset {offset}: {reason}")]
    CorruptRecord {
        file_id: u64,
        offset: u64,
        reason: String,
    },

    #[error("Snapshot is closed")]
    SnapshotClosed,

    #[error("Snapshot is already closed")]
    AlreadyClosed,

    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Key too large (limit: {limit}, actual: {actual})")]
    KeyTooLarge { limit: usize, actual: usize },

    #[error("Value too large (limit: {limit}, actual: {actual})")]
    ValueTooLarge { limit: usize, actual: usize },

    // The tombstone marker cannot be stored as user data.
    #[error("Value is reserved as the deletion marker")]
    ReservedValue,

    #[error("Concurrency lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl DbError {
    pub(crate) fn corrupt(file_id: u64, offset: u64, reason: impl Into<String>) -> Self {
        DbError::CorruptRecord {
            file_id,
            offset,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for DbError {
    fn from(err: config::ConfigError) -> Self {
        DbError::Config(err.to_string())
    }
}

// Result type alias for convenience
pub type DbResult<T> = Result<T, DbError>;

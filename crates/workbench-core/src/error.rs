use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BranchError {
    #[error("Invalid fork point {index}: {reason}")]
    InvalidForkPoint { index: usize, reason: String },

    #[error("Unknown branch: {0}")]
    UnknownBranch(String),

    #[error("Invalid turn: {0}")]
    InvalidTurn(String),

    #[error("Corrupt branch tree: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Unreadable value for '{key}': {reason}")]
    Decode { key: String, reason: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unreadable legacy record for scope '{scope}': {reason}")]
    Migration { scope: String, reason: String },

    #[error("Corrupt conversation record for scope '{scope}': {reason}")]
    Corrupt { scope: String, reason: String },

    #[error("Invalid scope: {0}")]
    InvalidScope(String),
}

/// A stored record that cannot be converted into the current shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MigrationError(pub String);

pub type BranchResult<T> = std::result::Result<T, BranchError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type Result<T> = std::result::Result<T, PersistenceError>;

//! Error types for storage, replication and cache operations.

use thiserror::Error;

/// Main error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Database error: {0}")]
    Connectivity(#[from] rusqlite::Error),

    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Replication bus for {0} is stopped")]
    BusStopped(String),

    #[error("Replication already enabled for {0}")]
    ReplicationEnabled(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl StorageError {
    /// True when the value is simply absent and a default may be substituted.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// True when the database could not be reached or the statement timed out.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StorageError::Connectivity(_))
    }

    /// True for corrupt rows or payloads.
    pub fn is_decode(&self) -> bool {
        matches!(self, StorageError::Decode(_))
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

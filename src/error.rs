//! Histree Error Types

use thiserror::Error;

/// Result type alias for histree operations
pub type Result<T> = std::result::Result<T, Error>;

/// Histree error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage timeout: {0}")]
    Timeout(String),

    #[error("Stale or duplicate write to tree {tree_id} branch {branch_id} node {node_id}")]
    ConstraintViolation {
        tree_id: uuid::Uuid,
        branch_id: uuid::Uuid,
        node_id: i64,
    },

    // Branch metadata errors
    #[error("Branch {branch_id} already exists in tree {tree_id}")]
    DuplicateBranch {
        tree_id: uuid::Uuid,
        branch_id: uuid::Uuid,
    },

    #[error("Branch {branch_id} not found in tree {tree_id}")]
    UnknownBranch {
        tree_id: uuid::Uuid,
        branch_id: uuid::Uuid,
    },

    // Replication errors
    #[error("Event gap: expected first event {expected}, task starts at {got}")]
    EventGap { expected: i64, got: i64 },

    #[error("Task quarantined to DLQ: {0}")]
    Quarantined(String),

    #[error("Malformed replication task: {0}")]
    MalformedTask(String),

    #[error("Replication error: {0}")]
    Replication(String),

    // Encoding errors
    #[error("Blob encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Unsupported blob encoding: {0}")]
    UnsupportedEncoding(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by the replication loop.
    ///
    /// Constraint and metadata errors are never retried blindly; the
    /// applier re-validates instead. Transient store failures and event
    /// gaps (a later delivery may fill the gap) are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Timeout(_) | Error::EventGap { .. }
        )
    }
}

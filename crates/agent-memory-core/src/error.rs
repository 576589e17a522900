//! Closed error taxonomy for every store and the manager that composes them.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors that can occur anywhere in the memory core.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A store method was called before the owning `MemoryManager` finished
    /// opening its database handle.
    #[error("store not initialised")]
    NotInitialised,

    /// Underlying storage IO or constraint violation. Carries the operation
    /// name so callers can tell `add` apart from `query` in logs.
    #[error("database error during {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Input shape violates a documented invariant (empty summary, missing
    /// required field, embedding dimension mismatch, ...).
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Task version mismatch, or a tree path collision under one root.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced id is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A profile key fell outside the configured whitelist.
    #[error("profile key not allowed: {0}")]
    ProfileKeyNotAllowed(String),

    /// The FTS or vector backend failed to execute a search.
    #[error("semantic search failed: {0}")]
    SemanticSearch(String),

    /// A vector operation was requested with no vector backend configured.
    #[error("vector backend disabled")]
    VectorDisabled,

    /// A compaction was requested while one was already running.
    #[error("compaction already in progress")]
    AlreadyInProgress,

    /// The operation was cancelled mid-flight; any in-progress transaction
    /// was rolled back, but earlier committed sub-steps remain.
    #[error("operation cancelled")]
    Cancelled,
}

impl MemoryError {
    pub fn database(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Database {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::database("sqlite", err)
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invalid(format!("serialisation failed: {err}"))
    }
}

//! Error types for beacon-core

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at construction)
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite-backed storage error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Network failure talking to the ingestion endpoint
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Ingestion endpoint answered with a non-2xx status
    #[error("ingestion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// The facade already holds an active tracker
    #[error("tracker is already initialized")]
    AlreadyInitialized,

    /// The facade has no active tracker
    #[error("tracker is not initialized")]
    NotInitialized,
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;

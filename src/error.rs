//! Error types for the ssh-sync server

use thiserror::Error;

/// Result type alias for ssh-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ssh-sync server
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed input (bad PEM, bad token shape, bad JSON)
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Resource not found (unknown user, machine, or challenge)
    #[error("not found: {0}")]
    NotFound(String),

    /// Signature or claim verification failed
    #[error("verification failed: {0}")]
    Verification(String),

    /// Token declared an algorithm outside the allow-list
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The accept window elapsed before the challenge was answered
    #[error("handshake timed out")]
    Timeout,

    /// Connection read/write failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol violation (message arrived in the wrong state)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Coordination broker failure
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

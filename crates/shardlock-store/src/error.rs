//! Error types for session store operations.
//!
//! Lock contention, missing records and stale expiration candidates are not
//! errors; they come back as ordinary results. Only infrastructure failures
//! and bad configuration end up here.

/// Error type for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite round trip failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure preparing a database location.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A non-SQL backend failed to serve the request.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid store configuration, reported at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stored record could not be mapped back into a session.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Result type for session store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

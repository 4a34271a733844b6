use std::time::Duration;
use thiserror::Error;

/// Main error type for kbvault
#[derive(Error, Debug)]
pub enum KbError {
    /// The mutation queue has not been started or was stopped
    #[error("Mutation queue is not running")]
    QueueNotRunning,

    /// A write task did not complete within the submit timeout
    #[error("Task {id} timed out after {timeout:?}")]
    TaskTimeout { id: u64, timeout: Duration },

    /// A pending write task was cancelled by queue shutdown
    #[error("Task {0} was cancelled")]
    TaskCancelled(u64),

    /// A single statement failed; the queue keeps running
    #[error("Statement failed: {0}")]
    Statement(rusqlite::Error),

    /// Connection, pragma or migration errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A scanned directory could not be read
    #[error("Scan IO error at {path}: {source}")]
    ScanIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// A document could not be loaded or chunked
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// Knowledge base node or document not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A root with the same location is already registered
    #[error("Knowledge base already registered: {0}")]
    DuplicateKnowledgeBase(String),

    /// A result row did not have the expected shape
    #[error("Unexpected column value: {0}")]
    Column(String),
}

/// Convenient Result type using KbError
pub type Result<T> = std::result::Result<T, KbError>;

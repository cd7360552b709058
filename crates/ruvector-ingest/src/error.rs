//! Error types for the ingestion pipeline

use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ingestion pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File parsing error
    #[error("Failed to parse file '{filename}': {message}")]
    FileParse { filename: String, message: String },

    /// Parser id not known to the registry, or not servable by the document store
    #[error("Unsupported parser: {0}")]
    UnsupportedParser(String),

    /// Embedding error
    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    /// Chat model error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Document store error
    #[error("Document store error: {0}")]
    DocStore(String),

    /// Blob storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Blob not found in storage
    #[error("Object not found: {bucket}/{name}")]
    ObjectNotFound { bucket: String, name: String },

    /// Work queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Metadata database error
    #[error("Database error: {0}")]
    Database(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Raised by a progress update that observes a cancellation request
    #[error("Task has been canceled")]
    Canceled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a file parse error
    pub fn file_parse(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileParse {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create an LLM error
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm(message.into())
    }

    /// Create a document store error
    pub fn doc_store(message: impl Into<String>) -> Self {
        Self::DocStore(message.into())
    }

    /// Create a blob storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error is the cancellation signal
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_is_distinguished() {
        assert!(Error::Canceled.is_canceled());
        assert!(!Error::internal("boom").is_canceled());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::ObjectNotFound {
            bucket: "kb1".into(),
            name: "a.pdf".into(),
        };
        assert_eq!(err.to_string(), "Object not found: kb1/a.pdf");
        assert_eq!(
            Error::file_parse("a.pdf", "bad xref").to_string(),
            "Failed to parse file 'a.pdf': bad xref"
        );
    }
}

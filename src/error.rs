//! Error types shared by the producer, consumer and provider adapters

use thiserror::Error;

/// Library error type
#[derive(Error, Debug)]
pub enum Error {
    /// Request failed validation before any upstream call was made
    #[error("{0}")]
    Validation(String),

    #[error("Invalid query embedding: must be an array of {expected} numbers, got {actual}")]
    InvalidEmbedding { expected: usize, actual: usize },

    #[error("Embedding provider error: {0}")]
    Embedding(String),

    #[error("Search provider error: {0}")]
    Search(String),

    #[error("Generation provider error: {0}")]
    Generation(String),

    /// Server answered an exchange with a non-success status
    #[error("Server error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Model answer did not contain a usable obligations array
    #[error("Could not read obligations: {0}")]
    Extraction(String),

    #[error("Stream ended before the terminal frame")]
    Truncated,

    #[error("Invalid citation header: {0}")]
    CitationHeader(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// HTTP status used when this error is reported before a stream opens.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::InvalidEmbedding { .. }
            | Error::Embedding(_)
            | Error::Search(_)
            | Error::Generation(_)
            | Error::Extraction(_)
            | Error::Remote { .. }
            | Error::Truncated
            | Error::Http(_) => 502,
            Error::CitationHeader(_) | Error::Json(_) => 500,
        }
    }
}

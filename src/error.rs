//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Every failure the queue can encounter is classified as either *fatal*
//! (retrying cannot change the outcome — bad format, empty document, auth
//! failure) or *retryable* (transient network, rate limit, storage
//! contention). The queue uses [`PipelineError::is_retryable`] to decide
//! between backoff re-queueing and an immediate `failed` transition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No extractor is registered for the file's extension.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The format-specific parser rejected the document.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Extraction succeeded but produced no usable text
    /// (e.g. a scanned-image PDF).
    #[error("extraction produced no usable text")]
    EmptyContent,

    /// The embedding API call failed. `retryable` distinguishes rate
    /// limits and server/network errors from auth or configuration
    /// failures.
    #[error("embedding request failed: {message}")]
    Embedding { message: String, retryable: bool },

    /// The embedding API returned a vector of the wrong dimensionality.
    /// Always fatal — it means the configured model does not match.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// SQLite / storage failure. Typically transient lock or I/O
    /// contention, so retryable.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// The file record or its on-disk bytes are gone.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Upload parameter rejected before any queue entry exists.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An operation was requested in a state that does not permit it
    /// (e.g. `retry` on a file that is not `failed`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the queue should re-schedule the task with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Embedding { retryable, .. } => *retryable,
            PipelineError::Storage(_) | PipelineError::Io(_) => true,
            PipelineError::UnsupportedFormat(_)
            | PipelineError::ExtractionFailed(_)
            | PipelineError::EmptyContent
            | PipelineError::DimensionMismatch { .. }
            | PipelineError::FileNotFound(_)
            | PipelineError::Validation(_)
            | PipelineError::InvalidState(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

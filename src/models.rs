//! Core data models used throughout docharbor.
//!
//! These types represent the files, chunks, events, and search results that
//! flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Processing lifecycle of an uploaded file.
///
/// `pending → processing → ready` on success, `pending → processing →
/// failed` on exhausted retries or a fatal error. `failed → pending` only
/// via an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Ready => "ready",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<FileStatus> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "processing" => Some(FileStatus::Processing),
            "ready" => Some(FileStatus::Ready),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

/// One uploaded document, owned by a project.
///
/// Status, chunk count, and error message are mutated only by the
/// ingestion queue; everything else is set at upload time.
#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub id: String,
    pub project_id: String,
    pub filename: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub extension: String,
    pub status: FileStatus,
    pub chunk_count: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A contiguous, possibly overlapping slice of a file's extracted text.
///
/// Chunk indices per file form a dense `0..N-1` sequence. The embedding is
/// `None` until the embedding stage succeeds, after which it has exactly
/// the configured dimensionality.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub embedding: Option<Vec<f32>>,
    pub metadata_json: String,
    pub created_at: i64,
}

/// Structural metadata recorded by the extractor and carried on each chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserMetadata {
    pub extension: String,
    pub parser: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<usize>,
}

/// A vector-similarity hit returned by the store. Never persisted.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub file_id: String,
    pub filename: String,
    pub project_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
    pub file_updated_at: i64,
    pub chunk_created_at: i64,
}

/// Per-factor contributions to a hybrid ranking score.
#[derive(Debug, Clone, Copy)]
pub struct ScoreBreakdown {
    pub similarity: f64,
    pub text_match: f64,
    pub recency: f64,
}

/// A hybrid search result with surrounding context stitched in from the
/// adjacent chunks of the same file.
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub chunk_id: String,
    pub file_id: String,
    pub filename: String,
    pub project_id: String,
    pub text: String,
    pub context_before: Option<String>,
    pub context_after: Option<String>,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Read-only snapshot of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub total: usize,
}

/// Status-change event emitted by the queue for external collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct FileEvent {
    pub file_id: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<i64>,
}

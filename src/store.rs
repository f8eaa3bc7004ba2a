//! Chunk persistence and vector retrieval over SQLite.
//!
//! Embeddings live in a BLOB column beside the chunk text; similarity
//! search is a linear scan that decodes each candidate vector and computes
//! cosine similarity in process. An FTS5 shadow table (`chunks_fts`) is
//! kept in lockstep with `chunks` inside the same transaction, so a chunk
//! is either visible to both vector and keyword search or to neither.

use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::{SearchResult, TextChunk};

/// Upper bound on results per query, regardless of the caller's limit.
pub const MAX_QUERY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace the stored chunks for a file with `chunks`, atomically.
    ///
    /// If the file record no longer exists (deleted while its processing
    /// was in flight) nothing is written and `Ok(0)` is returned, so a
    /// racing delete never leaves orphaned chunks behind.
    pub async fn replace_file_chunks(&self, file_id: &str, chunks: &[TextChunk]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM project_files WHERE id = ?")
                .bind(file_id)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            tx.rollback().await?;
            return Ok(0);
        }

        sqlx::query("DELETE FROM chunks_fts WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = chunk.embedding.as_deref().map(vec_to_blob);
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, file_id, chunk_index, text, start_offset, end_offset,
                     embedding, metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.file_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(blob)
            .bind(&chunk.metadata_json)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, file_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.file_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    /// Remove every chunk (and its FTS row) belonging to a file.
    pub async fn delete_file_chunks(&self, file_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn chunk_count(&self, file_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Linear-scan cosine similarity over embedded chunks.
    ///
    /// Chunks without an embedding are skipped. Results below `threshold`
    /// are dropped; survivors come back ordered by score descending, ties
    /// broken by newest chunk first. `limit` is clamped to
    /// [`MAX_QUERY_LIMIT`].
    pub async fn query_similar(
        &self,
        query: &[f32],
        limit: usize,
        project_id: Option<&str>,
        threshold: f64,
    ) -> Result<Vec<SearchResult>> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);

        let sql = if project_id.is_some() {
            r#"
            SELECT c.id, c.file_id, c.chunk_index, c.text, c.embedding, c.created_at,
                   f.filename, f.project_id, f.updated_at
            FROM chunks c
            JOIN project_files f ON f.id = c.file_id
            WHERE c.embedding IS NOT NULL AND f.project_id = ?
            "#
        } else {
            r#"
            SELECT c.id, c.file_id, c.chunk_index, c.text, c.embedding, c.created_at,
                   f.filename, f.project_id, f.updated_at
            FROM chunks c
            JOIN project_files f ON f.id = c.file_id
            WHERE c.embedding IS NOT NULL
            "#
        };

        let mut q = sqlx::query(sql);
        if let Some(project) = project_id {
            q = q.bind(project);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut results: Vec<SearchResult> = Vec::new();
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let candidate = blob_to_vec(&blob);
            let score = cosine_similarity(query, &candidate) as f64;
            if score < threshold {
                continue;
            }
            results.push(SearchResult {
                chunk_id: row.try_get("id")?,
                file_id: row.try_get("file_id")?,
                filename: row.try_get("filename")?,
                project_id: row.try_get("project_id")?,
                chunk_index: row.try_get("chunk_index")?,
                text: row.try_get("text")?,
                score,
                file_updated_at: row.try_get("updated_at")?,
                chunk_created_at: row.try_get("created_at")?,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.chunk_created_at.cmp(&a.chunk_created_at))
        });
        results.truncate(limit);
        Ok(results)
    }

    /// Chunk ids whose text matches `query` under FTS5, optionally scoped
    /// to one project. Used as the keyword signal in hybrid ranking.
    pub async fn fts_matches(
        &self,
        query: &str,
        project_id: Option<&str>,
    ) -> Result<HashSet<String>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(HashSet::new());
        };

        let sql = if project_id.is_some() {
            r#"
            SELECT t.chunk_id FROM chunks_fts t
            JOIN project_files f ON f.id = t.file_id
            WHERE chunks_fts MATCH ? AND f.project_id = ?
            "#
        } else {
            "SELECT chunk_id FROM chunks_fts WHERE chunks_fts MATCH ?"
        };

        let mut q = sqlx::query_scalar::<_, String>(sql).bind(match_expr);
        if let Some(project) = project_id {
            q = q.bind(project);
        }
        let ids = q.fetch_all(&self.pool).await?;
        Ok(ids.into_iter().collect())
    }

    /// Text of the chunks directly before and after `chunk_index` in the
    /// same file. Either side is `None` at the file's edges.
    pub async fn neighbor_texts(
        &self,
        file_id: &str,
        chunk_index: i64,
    ) -> Result<(Option<String>, Option<String>)> {
        let before: Option<String> = sqlx::query_scalar(
            "SELECT text FROM chunks WHERE file_id = ? AND chunk_index = ?",
        )
        .bind(file_id)
        .bind(chunk_index - 1)
        .fetch_optional(&self.pool)
        .await?;

        let after: Option<String> = sqlx::query_scalar(
            "SELECT text FROM chunks WHERE file_id = ? AND chunk_index = ?",
        )
        .bind(file_id)
        .bind(chunk_index + 1)
        .fetch_optional(&self.pool)
        .await?;

        Ok((before, after))
    }
}

/// Turn free-form query text into a safe FTS5 MATCH expression: each token
/// is double-quoted (neutralizing FTS operators) and tokens are OR-ed.
/// Returns `None` when the query has no usable tokens.
fn fts_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        return None;
    }
    Some(tokens.join(" OR "))
}

//! Hybrid search: vector similarity blended with keyword matches and a
//! light recency decay, plus citation context stitched from neighboring
//! chunks.
//!
//! Combined score per chunk:
//!
//! ```text
//! score = w_sim * cosine + w_text * fts_hit + w_recency * 0.5^(age_days / 30)
//! ```
//!
//! with default weights 0.6 / 0.3 / 0.1. An empty result set is a valid
//! outcome; a query-time embedding failure is an error, never a silent
//! empty result.

use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::db;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{RankedResult, ScoreBreakdown};
use crate::store::{VectorStore, MAX_QUERY_LIMIT};

/// Characters of neighbor-chunk text attached on each side of a hit.
const CONTEXT_CHARS: usize = 200;
/// Similarity candidates fetched per requested result, so the keyword and
/// recency factors can promote hits from below the requested cut.
const CANDIDATE_FACTOR: usize = 3;
/// Recency half-life in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub project_id: Option<String>,
    pub limit: Option<usize>,
    pub threshold: Option<f64>,
}

pub struct SearchService {
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl SearchService {
    pub fn new(store: VectorStore, embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<RankedResult>> {
        let limit = options.limit.unwrap_or(self.config.default_limit).max(1);
        let threshold = options.threshold.unwrap_or(self.config.similarity_threshold);
        let project = options.project_id.as_deref();

        let query_vector = self.embedder.embed_one(query).await?;
        let candidates = self
            .store
            .query_similar(
                &query_vector,
                (limit * CANDIDATE_FACTOR).min(MAX_QUERY_LIMIT),
                project,
                threshold,
            )
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let keyword_hits = self.store.fts_matches(query, project).await?;
        let now = db::now_ts();

        let mut scored: Vec<(f64, ScoreBreakdown, crate::models::SearchResult)> = candidates
            .into_iter()
            .map(|candidate| {
                let breakdown = ScoreBreakdown {
                    similarity: candidate.score,
                    text_match: if keyword_hits.contains(&candidate.chunk_id) {
                        1.0
                    } else {
                        0.0
                    },
                    recency: recency_weight(candidate.file_updated_at, now),
                };
                let combined = self.config.weight_similarity * breakdown.similarity
                    + self.config.weight_text_match * breakdown.text_match
                    + self.config.weight_recency * breakdown.recency;
                (combined, breakdown, candidate)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut results = Vec::with_capacity(scored.len());
        for (score, breakdown, candidate) in scored {
            let (before, after) = self
                .store
                .neighbor_texts(&candidate.file_id, candidate.chunk_index)
                .await?;
            results.push(RankedResult {
                chunk_id: candidate.chunk_id,
                file_id: candidate.file_id,
                filename: candidate.filename,
                project_id: candidate.project_id,
                text: candidate.text,
                context_before: before.map(|t| tail_chars(&t, CONTEXT_CHARS)),
                context_after: after.map(|t| head_chars(&t, CONTEXT_CHARS)),
                score,
                breakdown,
            });
        }
        Ok(results)
    }
}

/// Exponential decay on file age: 1.0 for a file modified now, 0.5 after
/// one half-life, floored at 0 for clock skew into the future (clamped).
fn recency_weight(file_updated_at: i64, now: i64) -> f64 {
    let age_secs = (now - file_updated_at).max(0) as f64;
    let age_days = age_secs / 86_400.0;
    0.5f64.powf(age_days / RECENCY_HALF_LIFE_DAYS)
}

/// The last `n` characters of `s` (UTF-8 safe).
fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

/// The first `n` characters of `s` (UTF-8 safe).
fn head_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

//! Embedding generation and vector utilities.
//!
//! The [`Embedder`] trait is the seam between the pipeline and whatever
//! produces vectors. Two implementations:
//!
//! - **[`RemoteEmbedder`]** — calls an OpenAI-compatible `/embeddings`
//!   endpoint with batching, rate-limit backoff, and retry.
//! - **[`HashEmbedder`]** — deterministic offline pseudo-embeddings from
//!   token hashes; used for tests and keyless setups.
//!
//! Also provides the vector helpers shared with the store:
//! [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

/// Hard cap on texts per API request, regardless of configuration.
pub const MAX_BATCH: usize = 50;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Order-preserving; the output has the same
    /// length as the input and every vector has [`Embedder::dims`]
    /// dimensions.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality this embedder produces.
    fn dims(&self) -> usize;

    /// Convenience wrapper for query-time embedding.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| PipelineError::Embedding {
            message: "empty embedding response".to_string(),
            retryable: false,
        })
    }
}

/// Instantiate the embedder named by the configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "remote" => Ok(Arc::new(RemoteEmbedder::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        other => Err(PipelineError::Validation(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

// ============ Remote (OpenAI-compatible) ============

/// HTTP embedding client for OpenAI-compatible `/embeddings` endpoints.
///
/// Splits input into sub-batches of at most `batch_size` texts (hard cap
/// [`MAX_BATCH`]). Retry strategy per request:
/// - HTTP 429 and 5xx → retry with exponential backoff
/// - network error / request timeout → retry
/// - any other 4xx (auth, bad request) → fail immediately
pub struct RemoteEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    backoff_base: Duration,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Embedding {
                message: format!("http client: {e}"),
                retryable: false,
            })?;

        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size.clamp(1, MAX_BATCH),
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Shrink the retry backoff base. Test hook — keeps the retry path
    /// fast without touching its logic.
    #[doc(hidden)]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.backoff_base, attempt)).await;
            }

            let mut request = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| PipelineError::Embedding {
                                message: format!("invalid response body: {e}"),
                                retryable: false,
                            })?;
                        return parse_embeddings_response(&json, texts.len());
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if is_retryable_status(status) {
                        last_err = Some(PipelineError::Embedding {
                            message: format!("API error {status}: {body_text}"),
                            retryable: true,
                        });
                        continue;
                    }
                    // Auth/client error: retrying cannot help.
                    return Err(PipelineError::Embedding {
                        message: format!("API error {status}: {body_text}"),
                        retryable: false,
                    });
                }
                Err(e) => {
                    // Connection failures and timeouts are transient.
                    last_err = Some(PipelineError::Embedding {
                        message: format!("request failed: {e}"),
                        retryable: true,
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| PipelineError::Embedding {
            message: "embedding failed after retries".to_string(),
            retryable: true,
        }))
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.request_batch(batch).await?;
            for v in &vectors {
                if v.len() != self.dims {
                    return Err(PipelineError::DimensionMismatch {
                        expected: self.dims,
                        actual: v.len(),
                    });
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, shift
/// capped to keep the delay bounded.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << (attempt - 1).min(5))
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Parse an OpenAI-style `{"data": [{"index": i, "embedding": [...]}]}`
/// response, restoring input order via the `index` field.
fn parse_embeddings_response(json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PipelineError::Embedding {
            message: "invalid response: missing data array".to_string(),
            retryable: false,
        })?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| PipelineError::Embedding {
                message: "invalid response: missing embedding".to_string(),
                retryable: false,
            })?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    if indexed.len() != expected {
        return Err(PipelineError::Embedding {
            message: format!(
                "invalid response: {} embeddings for {} inputs",
                indexed.len(),
                expected
            ),
            retryable: false,
        });
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Deterministic hash embedder ============

/// Offline bag-of-tokens embedder: each lower-cased token is hashed into a
/// bucket of a fixed-dimension vector, which is then L2-normalized. Texts
/// sharing vocabulary land near each other under cosine similarity, which
/// is enough for the pipeline, tests, and keyless local use.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap_or_default());
            vec[(bucket % self.dims as u64) as usize] += 1.0;
        }
        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Vector helpers ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
/// Round-trips exactly through [`blob_to_vec`].
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors: `dot(a,b) / (|a| * |b|)`.
///
/// Defined as `0.0` when either vector has zero magnitude, or when the
/// lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

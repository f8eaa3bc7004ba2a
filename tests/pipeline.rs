//! End-to-end pipeline tests: upload through processing to search, plus
//! the queue's failure, retry, pause, and concurrency behavior.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use docharbor::config::{ChunkingConfig, QueueConfig, RetrievalConfig, UploadConfig};
use docharbor::embedding::{Embedder, HashEmbedder};
use docharbor::error::{PipelineError, Result};
use docharbor::files::{FileService, UploadRequest};
use docharbor::models::FileStatus;
use docharbor::queue::IngestionQueue;
use docharbor::search::{SearchOptions, SearchService};
use docharbor::store::VectorStore;
use docharbor::{db, migrate};

const DIMS: usize = 32;

struct Harness {
    _dir: TempDir,
    pool: SqlitePool,
    store: VectorStore,
    queue: IngestionQueue,
    files: FileService,
    search: SearchService,
}

async fn harness() -> Harness {
    harness_with(Arc::new(HashEmbedder::new(DIMS)), fast_queue_config()).await
}

async fn harness_with(embedder: Arc<dyn Embedder>, queue_cfg: QueueConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::connect(&dir.path().join("harbor.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let store = VectorStore::new(pool.clone());
    let queue = IngestionQueue::new(
        pool.clone(),
        store.clone(),
        embedder.clone(),
        queue_cfg,
        ChunkingConfig::default(),
    );
    let files = FileService::new(
        pool.clone(),
        store.clone(),
        queue.clone(),
        UploadConfig {
            storage_dir: dir.path().join("blobs"),
            ..UploadConfig::default()
        },
    );
    let search = SearchService::new(store.clone(), embedder, RetrievalConfig::default());

    Harness {
        _dir: dir,
        pool,
        store,
        queue,
        files,
        search,
    }
}

fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        concurrency: 2,
        max_attempts: 3,
        backoff_base_ms: 10,
    }
}

fn txt(name: &str, content: &str) -> UploadRequest {
    UploadRequest {
        filename: name.to_string(),
        bytes: content.as_bytes().to_vec(),
    }
}

/// Always errors with a retryable failure until `fail_remaining` hits zero,
/// then behaves like a hash embedder.
struct FlakyEmbedder {
    fail_remaining: AtomicI32,
    inner: HashEmbedder,
}

impl FlakyEmbedder {
    fn new(failures: i32) -> Self {
        Self {
            fail_remaining: AtomicI32::new(failures),
            inner: HashEmbedder::new(DIMS),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(PipelineError::Embedding {
                message: "simulated 503".to_string(),
                retryable: true,
            });
        }
        self.inner.embed_batch(texts).await
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

/// Records the maximum number of simultaneous `embed_batch` calls.
struct GaugeEmbedder {
    current: AtomicUsize,
    max: AtomicUsize,
    inner: HashEmbedder,
}

impl GaugeEmbedder {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            inner: HashEmbedder::new(DIMS),
        }
    }
}

#[async_trait]
impl Embedder for GaugeEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        let out = self.inner.embed_batch(texts).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

#[tokio::test]
async fn upload_process_and_search_round_trip() {
    let h = harness().await;
    h.queue.start();
    let mut events = h.queue.subscribe();

    let created = h
        .files
        .upload(
            "proj-a",
            vec![txt(
                "deploy.txt",
                "The deployment checklist requires a database backup before rollout. \
                 Verify replication lag and take a snapshot first.",
            )],
        )
        .await
        .unwrap();
    let file_id = created[0].id.clone();

    h.queue.drain().await;
    h.queue.shutdown().await;

    let file = h.files.get(&file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Ready);
    assert_eq!(file.chunk_count, 1);
    assert!(file.last_error.is_none());

    // Lifecycle events arrived in order.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.status);
    }
    assert_eq!(seen, vec![FileStatus::Processing, FileStatus::Ready]);

    let results = h
        .search
        .search(
            "deployment checklist database backup",
            SearchOptions {
                project_id: Some("proj-a".to_string()),
                threshold: Some(0.1),
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].file_id, file_id);
    assert!(results[0].text.contains("deployment checklist"));
    // Keyword overlap earns the text-match bonus.
    assert!((results[0].breakdown.text_match - 1.0).abs() < 1e-9);

    h.pool.close().await;
}

#[tokio::test]
async fn fifteen_hundred_char_file_yields_two_offset_chunks() {
    let h = harness().await;
    h.queue.start();

    let created = h
        .files
        .upload("proj-a", vec![txt("long.txt", &"abcd ".repeat(300))])
        .await
        .unwrap();
    h.queue.drain().await;
    h.queue.shutdown().await;

    let file = h.files.get(&created[0].id).await.unwrap();
    assert_eq!(file.status, FileStatus::Ready);
    assert_eq!(file.chunk_count, 2);

    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT chunk_index, start_offset, end_offset FROM chunks WHERE file_id = ? ORDER BY chunk_index",
    )
    .bind(&created[0].id)
    .fetch_all(&h.pool)
    .await
    .unwrap();
    // Dense indices, spec'd overlap windows. (Extraction trims the final
    // trailing space, hence 1499.)
    assert_eq!(rows[0], (0, 0, 1000));
    assert_eq!(rows[1].0, 1);
    assert_eq!(rows[1].1, 800);
    assert!(rows[1].2 >= 1499);

    h.pool.close().await;
}

#[tokio::test]
async fn delete_leaves_no_orphaned_chunks() {
    let h = harness().await;
    h.queue.start();

    let created = h
        .files
        .upload(
            "proj-a",
            vec![txt("doc.txt", &"every word here becomes a chunk row ".repeat(200))],
        )
        .await
        .unwrap();
    let file_id = created[0].id.clone();
    h.queue.drain().await;
    h.queue.shutdown().await;

    assert!(h.store.chunk_count(&file_id).await.unwrap() > 0);

    h.files.delete(&file_id).await.unwrap();

    assert_eq!(h.store.chunk_count(&file_id).await.unwrap(), 0);
    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_id = ?")
        .bind(&file_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(orphans, 0);
    assert!(h.store.fts_matches("chunk", None).await.unwrap().is_empty());

    h.pool.close().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_file_and_retry_recovers_it() {
    // Three retryable failures exactly exhaust the three-attempt cap;
    // the fourth call (after explicit retry) succeeds.
    let h = harness_with(Arc::new(FlakyEmbedder::new(3)), fast_queue_config()).await;
    h.queue.start();

    let created = h
        .files
        .upload("proj-a", vec![txt("flaky.txt", "transient trouble ahead")])
        .await
        .unwrap();
    let file_id = created[0].id.clone();

    h.queue.drain().await;
    let file = h.files.get(&file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Failed);
    assert!(file.last_error.unwrap().contains("simulated 503"));
    // The failed task left the queue entirely.
    assert_eq!(h.queue.status().total, 0);

    h.queue.retry(&file_id).await.unwrap();
    h.queue.drain().await;
    h.queue.shutdown().await;

    let file = h.files.get(&file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Ready);
    assert_eq!(file.chunk_count, 1);

    h.pool.close().await;
}

#[tokio::test]
async fn concurrency_cap_holds_under_burst() {
    let gauge = Arc::new(GaugeEmbedder::new());
    let h = harness_with(gauge.clone(), fast_queue_config()).await;
    h.queue.start();

    let requests: Vec<UploadRequest> = (0..8)
        .map(|i| txt(&format!("burst-{i}.txt"), "short burst document"))
        .collect();
    h.files.upload("proj-a", requests).await.unwrap();

    h.queue.drain().await;
    h.queue.shutdown().await;

    let peak = gauge.max.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 2, "concurrency cap exceeded: {peak}");

    for file in h.files.list("proj-a").await.unwrap() {
        assert_eq!(file.status, FileStatus::Ready);
    }

    h.pool.close().await;
}

#[tokio::test]
async fn paused_file_is_skipped_until_resumed() {
    let h = harness().await;

    // Enqueue before the scheduler starts so the pause lands first.
    let created = h
        .files
        .upload(
            "proj-a",
            vec![txt("a.txt", "first document"), txt("b.txt", "second document")],
        )
        .await
        .unwrap();
    let paused_id = created[0].id.clone();
    h.queue.pause(&paused_id).unwrap();

    h.queue.start();
    h.queue.drain().await;

    assert_eq!(
        h.files.get(&paused_id).await.unwrap().status,
        FileStatus::Pending
    );
    assert_eq!(
        h.files.get(&created[1].id).await.unwrap().status,
        FileStatus::Ready
    );
    // The paused task kept its queue slot.
    assert_eq!(h.queue.status().total, 1);

    h.queue.resume(&paused_id).unwrap();
    h.queue.drain().await;
    h.queue.shutdown().await;

    assert_eq!(
        h.files.get(&paused_id).await.unwrap().status,
        FileStatus::Ready
    );

    h.pool.close().await;
}

#[tokio::test]
async fn resume_during_an_in_flight_stage_does_not_spawn_a_second_worker() {
    // Pause while the worker is inside the (slow) embedding stage, then
    // resume immediately: the original worker must carry on alone rather
    // than racing a freshly scheduled one over the same file.
    let gauge = Arc::new(GaugeEmbedder::new());
    let h = harness_with(gauge.clone(), fast_queue_config()).await;
    h.queue.start();
    let mut events = h.queue.subscribe();

    let created = h
        .files
        .upload("proj-a", vec![txt("slow.txt", "one document processed once")])
        .await
        .unwrap();
    let file_id = created[0].id.clone();

    while h.queue.status().processing == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // Land inside the 25ms embed call.
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.queue.pause(&file_id).unwrap();
    h.queue.resume(&file_id).unwrap();

    h.queue.drain().await;
    h.queue.shutdown().await;

    let peak = gauge.max.load(Ordering::SeqCst);
    assert_eq!(peak, 1, "same file embedded concurrently: {peak}");

    let file = h.files.get(&file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Ready);
    assert_eq!(file.chunk_count, 1);

    let ready_events = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.status == FileStatus::Ready)
        .count();
    assert_eq!(ready_events, 1);

    h.pool.close().await;
}

#[tokio::test]
async fn pausing_a_running_task_records_pending_when_the_worker_yields() {
    let gauge = Arc::new(GaugeEmbedder::new());
    let h = harness_with(gauge.clone(), fast_queue_config()).await;
    h.queue.start();

    let created = h
        .files
        .upload("proj-a", vec![txt("held.txt", "work interrupted midway")])
        .await
        .unwrap();
    let file_id = created[0].id.clone();

    while h.queue.status().processing == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.queue.pause(&file_id).unwrap();

    // The worker notices at its next stage boundary and writes the
    // pause back to the status row.
    let mut waited = 0;
    loop {
        let file = h.files.get(&file_id).await.unwrap();
        if file.status == FileStatus::Pending {
            break;
        }
        waited += 1;
        assert!(waited < 200, "status never returned to pending");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let status = h.queue.status();
    assert_eq!(status.processing, 0);
    assert_eq!(status.total, 1);

    h.queue.resume(&file_id).unwrap();
    h.queue.drain().await;
    h.queue.shutdown().await;
    assert_eq!(
        h.files.get(&file_id).await.unwrap().status,
        FileStatus::Ready
    );

    h.pool.close().await;
}

#[tokio::test]
async fn unsupported_and_empty_files_fail_without_retry() {
    // A whitespace-only document is fatal on the first attempt, so a
    // single-failure embedder would never even be reached.
    let h = harness().await;
    h.queue.start();

    let created = h
        .files
        .upload("proj-a", vec![txt("blank.txt", "   \n\t  \n")])
        .await
        .unwrap();
    h.queue.drain().await;
    h.queue.shutdown().await;

    let file = h.files.get(&created[0].id).await.unwrap();
    assert_eq!(file.status, FileStatus::Failed);
    assert!(file.last_error.is_some());

    // Validation rejects unsupported extensions before any record exists.
    let err = h
        .files
        .upload("proj-a", vec![txt("binary.exe", "MZ")])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    h.pool.close().await;
}

#[tokio::test]
async fn query_similar_threshold_and_order_example() {
    // Three stored vectors engineered to score 0.92, 0.81, and 0.65
    // against the query; threshold 0.7 keeps exactly the first two.
    let h = harness().await;

    sqlx::query(
        r#"
        INSERT INTO project_files
            (id, project_id, filename, storage_path, size_bytes, extension,
             status, created_at, updated_at)
        VALUES ('f1', 'p1', 'f1.txt', '/tmp/f1.txt', 1, 'txt', 'ready', 0, 0)
        "#,
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let unit_at = |cos: f32| vec![cos, (1.0 - cos * cos).sqrt()];
    let chunks: Vec<docharbor::models::TextChunk> = [0.92f32, 0.81, 0.65]
        .iter()
        .enumerate()
        .map(|(i, &cos)| docharbor::models::TextChunk {
            id: format!("c{i}"),
            file_id: "f1".to_string(),
            chunk_index: i as i64,
            text: format!("chunk {i}"),
            start_offset: 0,
            end_offset: 10,
            embedding: Some(unit_at(cos)),
            metadata_json: "{}".to_string(),
            created_at: i as i64,
        })
        .collect();
    h.store.replace_file_chunks("f1", &chunks).await.unwrap();

    let results = h
        .store
        .query_similar(&[1.0, 0.0], 10, None, 0.7)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk_id, "c0");
    assert_eq!(results[1].chunk_id, "c1");
    assert!(results[0].score > results[1].score);
    assert!(results.iter().all(|r| r.score >= 0.7));

    h.pool.close().await;
}

#[tokio::test]
async fn search_attaches_neighbor_context() {
    let h = harness().await;
    h.queue.start();

    // Long enough to produce several chunks so interior hits have
    // neighbors on both sides.
    let body = (0..120)
        .map(|i| format!("section {i} covers topic number {i} in detail."))
        .collect::<Vec<_>>()
        .join(" ");
    h.files
        .upload("proj-a", vec![txt("manual.txt", &body)])
        .await
        .unwrap();
    h.queue.drain().await;
    h.queue.shutdown().await;

    let results = h
        .search
        .search(
            "section 60 topic",
            SearchOptions {
                project_id: Some("proj-a".to_string()),
                threshold: Some(0.05),
                limit: Some(3),
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    let interior = results
        .iter()
        .find(|r| r.context_before.is_some() && r.context_after.is_some());
    if let Some(hit) = interior {
        assert!(hit.context_before.as_ref().unwrap().chars().count() <= 200);
        assert!(hit.context_after.as_ref().unwrap().chars().count() <= 200);
    }

    h.pool.close().await;
}

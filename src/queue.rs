//! Background ingestion queue.
//!
//! Drives each uploaded file through `pending → processing → ready/failed`
//! with bounded concurrency, priority ordering, retry backoff, and
//! pause/resume. Tasks live only in memory; the durable truth about a file
//! is its status row in `project_files`.
//!
//! Backoff is modeled as a next-eligible-run timestamp on the task rather
//! than a blocking sleep, so the scheduler stays responsive to pause and
//! cancel requests during the delay window. Status transitions are
//! broadcast as [`FileEvent`]s for external observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ChunkingConfig, QueueConfig};
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::extract;
use crate::models::{FileEvent, FileStatus, ParserMetadata, QueueStatus, TextChunk};
use crate::store::VectorStore;
use crate::{chunk, db};

/// Priority assigned by plain uploads.
pub const DEFAULT_PRIORITY: i64 = 0;
/// Priority assigned to explicit retries and resumed tasks.
pub const ELEVATED_PRIORITY: i64 = 10;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Paused,
}

#[derive(Debug)]
struct Task {
    priority: i64,
    attempts: u32,
    eligible_at: Instant,
    phase: Phase,
    seq: u64,
    /// Claim token of the worker currently processing this task. Set when
    /// the scheduler marks the task `Running`, released when the worker
    /// finishes or yields to a pause. A worker whose token no longer
    /// matches has been superseded and must stop without touching state.
    run: Option<u64>,
}

/// What a running worker should do at its next stage boundary.
enum Control {
    Continue,
    Paused,
    Gone,
}

struct Inner {
    pool: SqlitePool,
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    queue_cfg: QueueConfig,
    chunking_cfg: ChunkingConfig,
    tasks: Mutex<HashMap<String, Task>>,
    wake: Notify,
    events: broadcast::Sender<FileEvent>,
    seq: AtomicU64,
    shutdown: AtomicBool,
}

#[derive(Clone)]
pub struct IngestionQueue {
    inner: Arc<Inner>,
    scheduler: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl IngestionQueue {
    pub fn new(
        pool: SqlitePool,
        store: VectorStore,
        embedder: Arc<dyn Embedder>,
        queue_cfg: QueueConfig,
        chunking_cfg: ChunkingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pool,
                store,
                embedder,
                queue_cfg,
                chunking_cfg,
                tasks: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                events,
                seq: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the scheduler loop. Call once after construction.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(scheduler_loop(inner));
        if let Ok(mut slot) = self.scheduler.lock() {
            *slot = Some(handle);
        }
    }

    /// Subscribe to status-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a file for processing. Idempotent: a file already queued,
    /// running, or paused is left untouched.
    pub fn enqueue(&self, file_id: &str, priority: i64) {
        let mut tasks = lock_tasks(&self.inner);
        if tasks.contains_key(file_id) {
            return;
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        tasks.insert(
            file_id.to_string(),
            Task {
                priority,
                attempts: 0,
                eligible_at: Instant::now(),
                phase: Phase::Queued,
                seq,
                run: None,
            },
        );
        drop(tasks);
        debug!(file_id, priority, "enqueued");
        self.inner.wake.notify_one();
    }

    /// Re-queue a failed file at elevated priority with a fresh attempt
    /// counter. Errors unless the file is currently `failed`.
    pub async fn retry(&self, file_id: &str) -> Result<()> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM project_files WHERE id = ?")
                .bind(file_id)
                .fetch_optional(&self.inner.pool)
                .await?;
        let status = status.ok_or_else(|| PipelineError::FileNotFound(file_id.to_string()))?;
        if FileStatus::parse(&status) != Some(FileStatus::Failed) {
            return Err(PipelineError::InvalidState(format!(
                "retry requires a failed file, got status '{status}'"
            )));
        }

        set_status(&self.inner.pool, file_id, FileStatus::Pending, None).await?;
        self.enqueue(file_id, ELEVATED_PRIORITY);
        emit(&self.inner, file_id, FileStatus::Pending, None, None);
        info!(file_id, "retry requested");
        Ok(())
    }

    /// Remove a task from scheduling without losing it. Valid while the
    /// task is queued or running; a running task stops at its next stage
    /// boundary, keeping any cached extraction.
    pub fn pause(&self, file_id: &str) -> Result<()> {
        let mut tasks = lock_tasks(&self.inner);
        let task = tasks.get_mut(file_id).ok_or_else(|| {
            PipelineError::InvalidState(format!("no queued task for file {file_id}"))
        })?;
        match task.phase {
            Phase::Queued | Phase::Running => {
                task.phase = Phase::Paused;
                drop(tasks);
                emit(&self.inner, file_id, FileStatus::Pending, None, None);
                info!(file_id, "paused");
                Ok(())
            }
            Phase::Paused => Ok(()),
        }
    }

    /// Return a paused task to the runnable set at elevated priority.
    ///
    /// If the original worker has not yet noticed the pause (still inside
    /// a stage), the task is handed straight back to it instead of being
    /// re-queued, so a second worker is never spawned for the same file.
    pub fn resume(&self, file_id: &str) -> Result<()> {
        let mut tasks = lock_tasks(&self.inner);
        let task = tasks.get_mut(file_id).ok_or_else(|| {
            PipelineError::InvalidState(format!("no queued task for file {file_id}"))
        })?;
        if task.phase != Phase::Paused {
            return Err(PipelineError::InvalidState(format!(
                "file {file_id} is not paused"
            )));
        }

        if task.run.is_some() {
            // Still claimed: the worker will see `Continue` at its next
            // stage boundary and carry on.
            task.phase = Phase::Running;
            drop(tasks);
            emit(&self.inner, file_id, FileStatus::Processing, None, None);
            info!(file_id, "resumed in place");
            return Ok(());
        }

        task.phase = Phase::Queued;
        task.priority = ELEVATED_PRIORITY;
        task.eligible_at = Instant::now();
        drop(tasks);
        emit(&self.inner, file_id, FileStatus::Pending, None, None);
        info!(file_id, "resumed");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Drop any task for the file, in-flight or not. Safe to call when no
    /// task exists. A worker already past its last control check may finish
    /// its stage, but the store refuses chunk writes for deleted files.
    pub fn cancel_and_remove(&self, file_id: &str) {
        let removed = lock_tasks(&self.inner).remove(file_id).is_some();
        if removed {
            debug!(file_id, "task cancelled");
            self.inner.wake.notify_one();
        }
    }

    /// Read-only snapshot of queue depth.
    pub fn status(&self) -> QueueStatus {
        let tasks = lock_tasks(&self.inner);
        let pending = tasks.values().filter(|t| t.phase == Phase::Queued).count();
        let processing = tasks.values().filter(|t| t.phase == Phase::Running).count();
        QueueStatus {
            pending,
            processing,
            total: tasks.len(),
        }
    }

    /// Wait until no task is queued or running (paused tasks remain).
    pub async fn drain(&self) {
        loop {
            let busy = {
                let tasks = lock_tasks(&self.inner);
                tasks.values().any(|t| t.phase != Phase::Paused)
            };
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop the scheduler loop. In-flight workers run to completion.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let handle = self.scheduler.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn lock_tasks(inner: &Inner) -> std::sync::MutexGuard<'_, HashMap<String, Task>> {
    // The map is only held for short, non-panicking sections; a poisoned
    // lock still contains usable state.
    inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit(
    inner: &Inner,
    file_id: &str,
    status: FileStatus,
    error: Option<String>,
    chunk_count: Option<i64>,
) {
    // Send fails only when nobody is subscribed, which is fine.
    let _ = inner.events.send(FileEvent {
        file_id: file_id.to_string(),
        status,
        error,
        chunk_count,
    });
}

async fn scheduler_loop(inner: Arc<Inner>) {
    info!(
        concurrency = inner.queue_cfg.concurrency,
        "ingestion scheduler started"
    );
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let (picked, next_eligible) = {
            let mut tasks = lock_tasks(&inner);
            let running = tasks.values().filter(|t| t.phase == Phase::Running).count();

            let mut picked: Option<String> = None;
            let mut next_eligible: Option<Instant> = None;
            if running < inner.queue_cfg.concurrency {
                let mut best: Option<(&String, &Task)> = None;
                for (id, task) in tasks.iter() {
                    if task.phase != Phase::Queued {
                        continue;
                    }
                    if task.eligible_at > now {
                        next_eligible = Some(match next_eligible {
                            Some(t) => t.min(task.eligible_at),
                            None => task.eligible_at,
                        });
                        continue;
                    }
                    // Highest priority wins; FIFO among equals.
                    let better = match best {
                        None => true,
                        Some((_, b)) => {
                            task.priority > b.priority
                                || (task.priority == b.priority && task.seq < b.seq)
                        }
                    };
                    if better {
                        best = Some((id, task));
                    }
                }
                picked = best.map(|(id, _)| id.clone());
            }

            let mut claim = None;
            if let Some(id) = &picked {
                if let Some(task) = tasks.get_mut(id) {
                    let run = inner.seq.fetch_add(1, Ordering::Relaxed);
                    task.phase = Phase::Running;
                    task.run = Some(run);
                    claim = Some(run);
                }
            }
            (picked.zip(claim), next_eligible)
        };

        if let Some((file_id, run)) = picked {
            let worker_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                run_task(worker_inner, file_id, run).await;
            });
            continue;
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = async {
                match next_eligible {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
    }
    info!("ingestion scheduler stopped");
}

/// What a worker should do when it hits a stage boundary. A claim-token
/// mismatch means this worker has been superseded (task cancelled, or a
/// later run owns it) and must stop without touching state.
fn control(inner: &Inner, file_id: &str, run: u64) -> Control {
    let tasks = lock_tasks(inner);
    match tasks.get(file_id) {
        None => Control::Gone,
        Some(t) if t.run != Some(run) => Control::Gone,
        Some(t) if t.phase == Phase::Paused => Control::Paused,
        Some(_) => Control::Continue,
    }
}

/// Remove the task only if it still belongs to run `run`. Returns whether
/// the removal happened; a superseded worker must not touch the entry.
fn remove_if_owned(inner: &Inner, file_id: &str, run: u64) -> bool {
    let mut tasks = lock_tasks(inner);
    let owned = tasks
        .get(file_id)
        .map(|t| t.run == Some(run))
        .unwrap_or(false);
    if owned {
        tasks.remove(file_id);
    }
    owned
}

async fn run_task(inner: Arc<Inner>, file_id: String, run: u64) {
    let outcome = process_file(&inner, &file_id, run).await;

    match outcome {
        Ok(Outcome::Ready(chunk_count)) => {
            if remove_if_owned(&inner, &file_id, run) {
                emit(&inner, &file_id, FileStatus::Ready, None, Some(chunk_count));
                info!(%file_id, chunk_count, "file ready");
            }
        }
        Ok(Outcome::Paused) => {
            // Release the claim so resume re-queues instead of handing the
            // task back to this (now finished) worker, and record the
            // pause durably so the status row agrees with the event
            // stream.
            let released = {
                let mut tasks = lock_tasks(&inner);
                match tasks.get_mut(&file_id) {
                    Some(task) if task.run == Some(run) => {
                        task.run = None;
                        true
                    }
                    _ => false,
                }
            };
            if released {
                if let Err(e) =
                    set_status(&inner.pool, &file_id, FileStatus::Pending, None).await
                {
                    error!(%file_id, error = %e, "failed to record pause status");
                }
                debug!(%file_id, "worker yielded to pause");
            }
        }
        Ok(Outcome::Gone) => {
            remove_if_owned(&inner, &file_id, run);
            debug!(%file_id, "file vanished mid-processing, dropping task");
        }
        Err(e) => handle_failure(&inner, &file_id, run, e).await,
    }

    inner.wake.notify_one();
}

async fn handle_failure(inner: &Arc<Inner>, file_id: &str, run: u64, e: PipelineError) {
    let attempts = {
        let mut tasks = lock_tasks(inner);
        match tasks.get_mut(file_id) {
            Some(task) if task.run == Some(run) => {
                task.attempts += 1;
                Some(task.attempts)
            }
            // Deleted or superseded while processing.
            _ => None,
        }
    };
    let Some(attempts) = attempts else {
        return;
    };

    if e.is_retryable() && attempts < inner.queue_cfg.max_attempts {
        let delay =
            Duration::from_millis(inner.queue_cfg.backoff_base_ms) * (1u32 << (attempts - 1).min(8));
        warn!(
            file_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "stage failed, backing off"
        );
        {
            let mut tasks = lock_tasks(inner);
            if let Some(task) = tasks.get_mut(file_id) {
                task.phase = Phase::Queued;
                task.eligible_at = Instant::now() + delay;
                task.priority -= 1;
                task.run = None;
            }
        }
        if let Err(db_err) =
            set_status(&inner.pool, file_id, FileStatus::Pending, Some(&e.to_string())).await
        {
            error!(file_id, error = %db_err, "failed to record retry status");
        }
        return;
    }

    error!(file_id, attempts, error = %e, "file failed");
    lock_tasks(inner).remove(file_id);
    let message = e.to_string();
    if let Err(db_err) =
        set_status(&inner.pool, file_id, FileStatus::Failed, Some(&message)).await
    {
        error!(file_id, error = %db_err, "failed to record failure status");
    }
    emit(inner, file_id, FileStatus::Failed, Some(message), None);
}

enum Outcome {
    Ready(i64),
    Paused,
    Gone,
}

async fn process_file(inner: &Arc<Inner>, file_id: &str, run: u64) -> Result<Outcome> {
    let row = sqlx::query(
        "SELECT filename, storage_path, extension, extracted_text FROM project_files WHERE id = ?",
    )
    .bind(file_id)
    .fetch_optional(&inner.pool)
    .await?;
    let Some(row) = row else {
        return Ok(Outcome::Gone);
    };
    let filename: String = row.try_get("filename")?;
    let storage_path: String = row.try_get("storage_path")?;
    let extension: String = row.try_get("extension")?;
    let cached_text: Option<String> = row.try_get("extracted_text")?;

    set_status(&inner.pool, file_id, FileStatus::Processing, None).await?;
    emit(inner, file_id, FileStatus::Processing, None, None);
    info!(file_id, %filename, "processing started");

    // Stage: extraction (skipped when a paused-then-resumed task already
    // cached its text).
    let (text, metadata) = match cached_text {
        Some(text) if !text.is_empty() => {
            debug!(file_id, "reusing cached extraction");
            let metadata = ParserMetadata {
                extension: extension.clone(),
                parser: "cache".to_string(),
                pages: None,
            };
            (text, metadata)
        }
        _ => {
            let bytes = read_file_bytes(&storage_path).await?;
            let (text, metadata) = extract::extract(&bytes, &filename)?;
            sqlx::query("UPDATE project_files SET extracted_text = ?, updated_at = ? WHERE id = ?")
                .bind(&text)
                .bind(db::now_ts())
                .bind(file_id)
                .execute(&inner.pool)
                .await?;
            (text, metadata)
        }
    };

    match control(inner, file_id, run) {
        Control::Paused => return Ok(Outcome::Paused),
        Control::Gone => return Ok(Outcome::Gone),
        Control::Continue => {}
    }

    // Stage: chunking.
    let slices = chunk::chunk_text(
        &text,
        inner.chunking_cfg.window_chars,
        inner.chunking_cfg.overlap_chars,
    );
    debug!(file_id, chunks = slices.len(), "chunked");

    // Stage: embedding.
    let texts: Vec<String> = slices.iter().map(|s| s.text.clone()).collect();
    let vectors = inner.embedder.embed_batch(&texts).await?;

    match control(inner, file_id, run) {
        Control::Paused => return Ok(Outcome::Paused),
        Control::Gone => return Ok(Outcome::Gone),
        Control::Continue => {}
    }

    // Stage: storage.
    let metadata_json = serde_json::to_string(&metadata)
        .map_err(|e| PipelineError::Validation(format!("metadata serialization: {e}")))?;
    let now = db::now_ts();
    let chunks: Vec<TextChunk> = slices
        .into_iter()
        .zip(vectors)
        .map(|(slice, vector)| TextChunk {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            chunk_index: slice.index,
            text: slice.text,
            start_offset: slice.start as i64,
            end_offset: slice.end as i64,
            embedding: Some(vector),
            metadata_json: metadata_json.clone(),
            created_at: now,
        })
        .collect();

    let written = inner.store.replace_file_chunks(file_id, &chunks).await?;
    if written == 0 && !chunks.is_empty() {
        // File record deleted between the control check and the write.
        return Ok(Outcome::Gone);
    }

    sqlx::query(
        "UPDATE project_files SET status = 'ready', chunk_count = ?, last_error = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(written as i64)
    .bind(db::now_ts())
    .bind(file_id)
    .execute(&inner.pool)
    .await?;

    Ok(Outcome::Ready(written as i64))
}

async fn read_file_bytes(path: &str) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        // A missing file cannot be fixed by retrying.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PipelineError::FileNotFound(path.to_string()))
        }
        Err(e) => Err(PipelineError::Io(e)),
    }
}

async fn set_status(
    pool: &SqlitePool,
    file_id: &str,
    status: FileStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE project_files SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(db::now_ts())
        .bind(file_id)
        .execute(pool)
        .await?;
    Ok(())
}

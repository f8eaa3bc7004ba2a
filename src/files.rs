//! File lifecycle operations: upload, listing, retrieval, and deletion.
//!
//! Uploads are validated synchronously (extension allow-list, per-file and
//! per-project size limits, file-count cap) before any bytes are copied or
//! queue entry created. Deletion follows a strict order so no writer can
//! resurrect chunks mid-delete: cancel the queue task, purge chunks, drop
//! the file record, then remove the on-disk copy.

use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

use crate::config::UploadConfig;
use crate::db;
use crate::error::{PipelineError, Result};
use crate::extract::{self, SUPPORTED_EXTENSIONS};
use crate::models::{FileStatus, ProjectFile};
use crate::queue::{IngestionQueue, DEFAULT_PRIORITY};
use crate::store::VectorStore;

/// One file offered for upload.
pub struct UploadRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct FileService {
    pool: SqlitePool,
    store: VectorStore,
    queue: IngestionQueue,
    config: UploadConfig,
}

impl FileService {
    pub fn new(
        pool: SqlitePool,
        store: VectorStore,
        queue: IngestionQueue,
        config: UploadConfig,
    ) -> Self {
        Self {
            pool,
            store,
            queue,
            config,
        }
    }

    /// Validate, persist, and enqueue a batch of uploads for one project.
    ///
    /// The whole batch is validated before anything is written, so a
    /// validation rejection leaves no partial state. An I/O failure while
    /// persisting can still leave earlier files of the batch created and
    /// queued; those records remain individually valid.
    pub async fn upload(
        &self,
        project_id: &str,
        requests: Vec<UploadRequest>,
    ) -> Result<Vec<ProjectFile>> {
        let (existing_count, existing_bytes) = self.project_usage(project_id).await?;

        let mut incoming_bytes: i64 = 0;
        for request in &requests {
            let ext = extract::file_extension(&request.filename);
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "unsupported file type: {}",
                    request.filename
                )));
            }
            let size = request.bytes.len() as i64;
            if size > self.config.max_file_bytes {
                return Err(PipelineError::Validation(format!(
                    "{} exceeds the per-file limit of {} bytes",
                    request.filename, self.config.max_file_bytes
                )));
            }
            incoming_bytes += size;
        }

        if existing_count + requests.len() > self.config.max_files_per_project {
            return Err(PipelineError::Validation(format!(
                "project file limit of {} exceeded",
                self.config.max_files_per_project
            )));
        }
        if existing_bytes + incoming_bytes > self.config.max_project_bytes {
            return Err(PipelineError::Validation(format!(
                "project size limit of {} bytes exceeded",
                self.config.max_project_bytes
            )));
        }

        std::fs::create_dir_all(&self.config.storage_dir)?;

        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            let id = uuid::Uuid::new_v4().to_string();
            let ext = extract::file_extension(&request.filename);
            let storage_path = self.config.storage_dir.join(format!("{id}.{ext}"));
            tokio::fs::write(&storage_path, &request.bytes).await?;

            let now = db::now_ts();
            let record = ProjectFile {
                id: id.clone(),
                project_id: project_id.to_string(),
                filename: request.filename,
                storage_path: storage_path.display().to_string(),
                size_bytes: request.bytes.len() as i64,
                extension: ext,
                status: FileStatus::Pending,
                chunk_count: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            sqlx::query(
                r#"
                INSERT INTO project_files
                    (id, project_id, filename, storage_path, size_bytes, extension,
                     status, chunk_count, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.project_id)
            .bind(&record.filename)
            .bind(&record.storage_path)
            .bind(record.size_bytes)
            .bind(&record.extension)
            .bind(record.status.as_str())
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;

            self.queue.enqueue(&id, DEFAULT_PRIORITY);
            info!(file_id = %id, filename = %record.filename, project_id, "file uploaded");
            created.push(record);
        }

        Ok(created)
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<ProjectFile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, filename, storage_path, size_bytes, extension,
                   status, chunk_count, last_error, created_at, updated_at
            FROM project_files WHERE project_id = ? ORDER BY created_at
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn get(&self, file_id: &str) -> Result<ProjectFile> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, filename, storage_path, size_bytes, extension,
                   status, chunk_count, last_error, created_at, updated_at
            FROM project_files WHERE id = ?
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::FileNotFound(file_id.to_string()))?;
        file_from_row(&row)
    }

    /// The file record plus its cached extracted text (empty until the
    /// extraction stage has run at least once).
    pub async fn get_with_content(&self, file_id: &str) -> Result<(ProjectFile, Option<String>)> {
        let record = self.get(file_id).await?;
        let text: Option<String> =
            sqlx::query_scalar("SELECT extracted_text FROM project_files WHERE id = ?")
                .bind(file_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((record, text))
    }

    /// Delete a file everywhere: queue, chunk store, record, disk.
    /// Cancellation happens first so a delete issued mid-retry wins.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let record = self.get(file_id).await?;

        self.queue.cancel_and_remove(file_id);
        self.store.delete_file_chunks(file_id).await?;
        sqlx::query("DELETE FROM project_files WHERE id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        remove_stored_bytes(&record.storage_path);
        info!(file_id, filename = %record.filename, "file deleted");
        Ok(())
    }

    /// Cascade used by project deletion: every file the project owns.
    pub async fn delete_project_files(&self, project_id: &str) -> Result<usize> {
        let files = self.list(project_id).await?;
        let count = files.len();
        for file in files {
            self.delete(&file.id).await?;
        }
        Ok(count)
    }

    async fn project_usage(&self, project_id: &str) -> Result<(usize, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(SUM(size_bytes), 0) AS total FROM project_files WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        let total: i64 = row.try_get("total")?;
        Ok((n as usize, total))
    }
}

fn remove_stored_bytes(path: &str) {
    if let Err(e) = std::fs::remove_file(Path::new(path)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path, error = %e, "could not remove stored file");
        }
    }
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProjectFile> {
    let status_str: String = row.try_get("status")?;
    let status = FileStatus::parse(&status_str)
        .ok_or_else(|| PipelineError::InvalidState(format!("unknown status '{status_str}'")))?;
    Ok(ProjectFile {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        filename: row.try_get("filename")?,
        storage_path: row.try_get("storage_path")?,
        size_bytes: row.try_get("size_bytes")?,
        extension: row.try_get("extension")?,
        status,
        chunk_count: row.try_get("chunk_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

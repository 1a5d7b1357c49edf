//! Document intake: content addressing, blob storage, task creation.
//!
//! Identity is the sha256 of the raw bytes. Submitting the same bytes
//! twice never creates a second active task: an in-flight task coalesces,
//! and content already classified and indexed at the configured versions
//! is answered without creating a task. Filenames are metadata only.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{now_ts, Document, DocumentFormat};
use crate::pipeline::{Pipeline, ProcessOutcome};
use crate::queue;
use crate::store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New task created and enqueued.
    Enqueued { content_hash: String, task_id: String },
    /// Same bytes already have an in-flight task; nothing new created.
    Coalesced { content_hash: String, task_id: String },
    /// Classification and index entry already exist at the configured
    /// versions; no task is needed.
    AlreadyComplete { content_hash: String },
}

impl SubmitOutcome {
    pub fn content_hash(&self) -> &str {
        match self {
            SubmitOutcome::Enqueued { content_hash, .. } => content_hash,
            SubmitOutcome::Coalesced { content_hash, .. } => content_hash,
            SubmitOutcome::AlreadyComplete { content_hash } => content_hash,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Enqueued { task_id, .. } => Some(task_id),
            SubmitOutcome::Coalesced { task_id, .. } => Some(task_id),
            SubmitOutcome::AlreadyComplete { .. } => None,
        }
    }
}

/// Resolve the document format: explicit flag, then file extension, then
/// magic bytes. Unresolvable input is rejected at the door.
pub fn resolve_format(
    declared: Option<DocumentFormat>,
    path: &Path,
    bytes: &[u8],
) -> Result<DocumentFormat> {
    if let Some(format) = declared {
        return Ok(format);
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if let Some(format) = DocumentFormat::from_str_opt(ext) {
            return Ok(format);
        }
    }
    if let Some(format) = DocumentFormat::sniff(bytes) {
        return Ok(format);
    }
    bail!(
        "unsupported format: cannot determine pdf/docx/html for {}",
        path.display()
    );
}

/// Submit a file for processing.
pub async fn submit(
    pool: &SqlitePool,
    config: &Config,
    path: &Path,
    declared: Option<DocumentFormat>,
) -> Result<SubmitOutcome> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.len() as u64 > config.storage.max_upload_bytes {
        bail!(
            "{} is {} bytes, over the {} byte upload limit",
            path.display(),
            bytes.len(),
            config.storage.max_upload_bytes
        );
    }
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }

    let format = resolve_format(declared, path, &bytes)?;
    let content_hash = format!("{:x}", Sha256::digest(&bytes));

    // Blob write is idempotent: same hash means same bytes
    tokio::fs::create_dir_all(&config.storage.blob_dir).await?;
    let blob_path = config.storage.blob_dir.join(&content_hash);
    if tokio::fs::try_exists(&blob_path).await? {
        tracing::debug!(content_hash = %content_hash, "blob already stored");
    } else {
        tokio::fs::write(&blob_path, &bytes).await?;
    }

    let doc = Document {
        content_hash: content_hash.clone(),
        format,
        size_bytes: bytes.len() as i64,
        original_filename: path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string()),
        blob_path: blob_path.to_string_lossy().into_owned(),
        received_at: now_ts(),
    };
    let created = store::upsert_document(pool, &doc).await?;
    if !created {
        info!(content_hash = %content_hash, "content already known, reusing document record");
    }

    // An in-flight task for the same bytes coalesces
    if let Some(active) = store::get_active_task(pool, &content_hash).await? {
        info!(content_hash = %content_hash, task_id = %active.task_id,
              "task already in flight, coalescing");
        return Ok(SubmitOutcome::Coalesced {
            content_hash,
            task_id: active.task_id,
        });
    }

    // Results at the configured versions already exist; nothing to rerun
    if store::results_complete(
        pool,
        &content_hash,
        &config.features.version,
        &config.model.version,
    )
    .await?
    {
        info!(content_hash = %content_hash, "already classified and indexed at current versions");
        return Ok(SubmitOutcome::AlreadyComplete { content_hash });
    }

    let task_id = Uuid::new_v4().to_string();
    match store::create_task(
        pool,
        &task_id,
        &content_hash,
        &config.features.version,
        &config.model.version,
    )
    .await
    {
        Ok(()) => {}
        Err(e) => {
            // Lost a race with a concurrent submit of the same bytes; the
            // partial unique index guarantees the winner's task exists
            if let Some(active) = store::get_active_task(pool, &content_hash).await? {
                warn!(content_hash = %content_hash, "concurrent submit, coalescing");
                return Ok(SubmitOutcome::Coalesced {
                    content_hash,
                    task_id: active.task_id,
                });
            }
            return Err(e);
        }
    }
    queue::enqueue(pool, &content_hash, &task_id).await?;
    info!(content_hash = %content_hash, task_id = %task_id, format = %format, "task enqueued");

    Ok(SubmitOutcome::Enqueued {
        content_hash,
        task_id,
    })
}

/// Create a fresh task for content whose previous run failed. The failed
/// task keeps its history; processing restarts from scratch under the
/// currently configured versions.
pub async fn requeue(pool: &SqlitePool, config: &Config, content_hash: &str) -> Result<String> {
    if store::get_document(pool, content_hash).await?.is_none() {
        bail!("no document with content hash {}", content_hash);
    }
    if let Some(active) = store::get_active_task(pool, content_hash).await? {
        bail!(
            "task {} is already in flight for {}",
            active.task_id,
            content_hash
        );
    }

    let task_id = Uuid::new_v4().to_string();
    store::create_task(
        pool,
        &task_id,
        content_hash,
        &config.features.version,
        &config.model.version,
    )
    .await?;
    queue::enqueue(pool, content_hash, &task_id).await?;
    info!(content_hash = %content_hash, task_id = %task_id, "requeued");
    Ok(task_id)
}

/// Process a submitted document in the calling process, without a worker
/// pool. Used by `submit --inline`; retryable failures still honor the
/// backoff schedule.
pub async fn process_inline(pipeline: Arc<Pipeline>, content_hash: &str) -> Result<ProcessOutcome> {
    let worker_id = format!("inline-{}", Uuid::new_v4());
    loop {
        let Some(msg) = queue::dequeue(pipeline.pool(), &worker_id, 60).await? else {
            // Message delayed by backoff, or claimed elsewhere
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        };
        if msg.content_hash != content_hash {
            // Someone else's work; put it straight back
            queue::nack_with_delay(pipeline.pool(), &msg.content_hash, &worker_id, 0).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }
        match pipeline.process(&msg, &worker_id).await? {
            ProcessOutcome::Retrying { delay_secs, .. } => {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
            outcome => return Ok(outcome),
        }
    }
}

//! SQLite result store: documents, tasks, and classification history.
//!
//! The store is the authoritative record; caches only memoize it. Task
//! stage transitions go through [`advance_stage`], which is guarded to
//! move exactly one step forward, so a stale worker can never rewind a
//! task or skip a stage.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::error::StageError;
use crate::models::{
    now_ts, ClassificationResult, Document, DocumentFormat, Label, Task, TaskStage,
};

/// Insert a document row, or leave the existing one alone when the same
/// bytes were uploaded before. Returns true when the row is new.
pub async fn upsert_document(pool: &SqlitePool, doc: &Document) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO documents (content_hash, format, size_bytes, original_filename, blob_path, received_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(content_hash) DO NOTHING
        "#,
    )
    .bind(&doc.content_hash)
    .bind(doc.format.as_str())
    .bind(doc.size_bytes)
    .bind(&doc.original_filename)
    .bind(&doc.blob_path)
    .bind(doc.received_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_document(pool: &SqlitePool, content_hash: &str) -> Result<Option<Document>> {
    let row = sqlx::query(
        "SELECT content_hash, format, size_bytes, original_filename, blob_path, received_at
         FROM documents WHERE content_hash = ?",
    )
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        let format_str: String = r.get("format");
        let format = DocumentFormat::from_str_opt(&format_str)
            .ok_or_else(|| anyhow::anyhow!("unknown format '{}' in documents", format_str))?;
        Ok(Document {
            content_hash: r.get("content_hash"),
            format,
            size_bytes: r.get("size_bytes"),
            original_filename: r.get("original_filename"),
            blob_path: r.get("blob_path"),
            received_at: r.get("received_at"),
        })
    })
    .transpose()
}

/// Create a new task in `queued`. Fails if the document already has a
/// non-terminal task (enforced by a partial unique index).
pub async fn create_task(
    pool: &SqlitePool,
    task_id: &str,
    content_hash: &str,
    feature_version: &str,
    model_version: &str,
) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO tasks (task_id, content_hash, current_stage, feature_version, model_version,
                           attempts_json, created_at, updated_at)
        VALUES (?, ?, 'queued', ?, ?, '{}', ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(content_hash)
    .bind(feature_version)
    .bind(model_version)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let stage_str: String = row.get("current_stage");
    let current_stage = TaskStage::from_str_opt(&stage_str)
        .ok_or_else(|| anyhow::anyhow!("unknown stage '{}' in tasks", stage_str))?;
    let attempts_json: String = row.get("attempts_json");
    let attempt_counts: BTreeMap<String, u32> = serde_json::from_str(&attempts_json)?;
    Ok(Task {
        task_id: row.get("task_id"),
        content_hash: row.get("content_hash"),
        current_stage,
        feature_version: row.get("feature_version"),
        model_version: row.get("model_version"),
        attempt_counts,
        last_error: row.get("last_error"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const TASK_COLUMNS: &str = "task_id, content_hash, current_stage, feature_version, model_version,
                            attempts_json, last_error, cancel_requested, created_at, updated_at";

pub async fn get_task(pool: &SqlitePool, task_id: &str) -> Result<Option<Task>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tasks WHERE task_id = ?",
        TASK_COLUMNS
    ))
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// The non-terminal task for a document, if one exists.
pub async fn get_active_task(pool: &SqlitePool, content_hash: &str) -> Result<Option<Task>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tasks WHERE content_hash = ? AND current_stage NOT IN ('done', 'failed')",
        TASK_COLUMNS
    ))
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// All tasks for a document, newest first.
pub async fn tasks_for_document(pool: &SqlitePool, content_hash: &str) -> Result<Vec<Task>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM tasks WHERE content_hash = ? ORDER BY created_at DESC, task_id DESC",
        TASK_COLUMNS
    ))
    .bind(content_hash)
    .fetch_all(pool)
    .await?;
    rows.iter().map(task_from_row).collect()
}

/// Move a task exactly one step forward. The WHERE clause pins the
/// expected current stage, so a concurrent or stale transition is a
/// no-op rather than a rewind.
pub async fn advance_stage(
    pool: &SqlitePool,
    task_id: &str,
    from: TaskStage,
    to: TaskStage,
) -> Result<bool, StageError> {
    debug_assert!(from.next() == Some(to) || to == TaskStage::Failed);
    let result = sqlx::query(
        "UPDATE tasks SET current_stage = ?, updated_at = ? WHERE task_id = ? AND current_stage = ?",
    )
    .bind(to.as_str())
    .bind(now_ts())
    .bind(task_id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record one attempt of a stage, returning the new count for that stage.
pub async fn bump_attempt(
    pool: &SqlitePool,
    task_id: &str,
    stage: TaskStage,
) -> Result<u32, StageError> {
    let row = sqlx::query("SELECT attempts_json FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StageError::Storage(format!("task {} not found", task_id)))?;
    let attempts_json: String = row.get("attempts_json");
    let mut counts: BTreeMap<String, u32> = serde_json::from_str(&attempts_json)
        .map_err(|e| StageError::Storage(format!("attempts_json: {}", e)))?;
    let count = counts.entry(stage.as_str().to_string()).or_insert(0);
    *count += 1;
    let count = *count;

    let updated = serde_json::to_string(&counts)
        .map_err(|e| StageError::Storage(format!("attempts_json: {}", e)))?;
    sqlx::query("UPDATE tasks SET attempts_json = ?, updated_at = ? WHERE task_id = ?")
        .bind(updated)
        .bind(now_ts())
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(count)
}

/// Move a task to `failed` with the error message preserved.
pub async fn record_failure(
    pool: &SqlitePool,
    task_id: &str,
    error: &str,
) -> Result<(), StageError> {
    sqlx::query(
        "UPDATE tasks SET current_stage = 'failed', last_error = ?, updated_at = ?
         WHERE task_id = ? AND current_stage NOT IN ('done', 'failed')",
    )
    .bind(error)
    .bind(now_ts())
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Note a retryable error without leaving the current stage.
pub async fn record_retry_error(
    pool: &SqlitePool,
    task_id: &str,
    error: &str,
) -> Result<(), StageError> {
    sqlx::query("UPDATE tasks SET last_error = ?, updated_at = ? WHERE task_id = ?")
        .bind(error)
        .bind(now_ts())
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Complete a task directly from `queued` when results for its version
/// triple already exist. Guarded the same way as [`advance_stage`].
pub async fn complete_short_circuit(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<bool, StageError> {
    let result = sqlx::query(
        "UPDATE tasks SET current_stage = 'done', updated_at = ?
         WHERE task_id = ? AND current_stage = 'queued'",
    )
    .bind(now_ts())
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Ask a running task to stop at the next stage boundary.
pub async fn request_cancel(pool: &SqlitePool, task_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET cancel_requested = 1, updated_at = ?
         WHERE task_id = ? AND current_stage NOT IN ('done', 'failed')",
    )
    .bind(now_ts())
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn cancel_requested(pool: &SqlitePool, task_id: &str) -> Result<bool, StageError> {
    let row = sqlx::query("SELECT cancel_requested FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("cancel_requested") != 0).unwrap_or(false))
}

/// Insert a classification row. Insert-only: an existing row for the
/// same version triple wins and this call becomes a no-op.
pub async fn record_classification(
    pool: &SqlitePool,
    result: &ClassificationResult,
) -> Result<(), StageError> {
    sqlx::query(
        r#"
        INSERT INTO classifications (content_hash, feature_version, model_version,
                                     label, confidence, needs_review, classified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(content_hash, feature_version, model_version) DO NOTHING
        "#,
    )
    .bind(&result.content_hash)
    .bind(&result.feature_version)
    .bind(&result.model_version)
    .bind(result.label.as_str())
    .bind(result.confidence)
    .bind(result.needs_review as i64)
    .bind(result.classified_at)
    .execute(pool)
    .await?;
    Ok(())
}

fn classification_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ClassificationResult> {
    let label_str: String = row.get("label");
    let label = Label::from_str_opt(&label_str)
        .ok_or_else(|| anyhow::anyhow!("unknown label '{}' in classifications", label_str))?;
    Ok(ClassificationResult {
        content_hash: row.get("content_hash"),
        feature_version: row.get("feature_version"),
        model_version: row.get("model_version"),
        label,
        confidence: row.get("confidence"),
        needs_review: row.get::<i64, _>("needs_review") != 0,
        classified_at: row.get("classified_at"),
    })
}

pub async fn get_classification(
    pool: &SqlitePool,
    content_hash: &str,
    feature_version: &str,
    model_version: &str,
) -> Result<Option<ClassificationResult>> {
    let row = sqlx::query(
        "SELECT content_hash, feature_version, model_version, label, confidence, needs_review, classified_at
         FROM classifications
         WHERE content_hash = ? AND feature_version = ? AND model_version = ?",
    )
    .bind(content_hash)
    .bind(feature_version)
    .bind(model_version)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(classification_from_row).transpose()
}

/// True when both the classification row and the index entry already
/// exist for a version triple, i.e. reprocessing would change nothing.
pub async fn results_complete(
    pool: &SqlitePool,
    content_hash: &str,
    feature_version: &str,
    model_version: &str,
) -> Result<bool> {
    let classified = get_classification(pool, content_hash, feature_version, model_version)
        .await?
        .is_some();
    if !classified {
        return Ok(false);
    }
    let indexed: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM index_entries WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_one(pool)
            .await?;
    Ok(indexed)
}

/// Full classification history for a document, newest first.
pub async fn classification_history(
    pool: &SqlitePool,
    content_hash: &str,
) -> Result<Vec<ClassificationResult>> {
    let rows = sqlx::query(
        "SELECT content_hash, feature_version, model_version, label, confidence, needs_review, classified_at
         FROM classifications WHERE content_hash = ? ORDER BY classified_at DESC",
    )
    .bind(content_hash)
    .fetch_all(pool)
    .await?;
    rows.iter().map(classification_from_row).collect()
}

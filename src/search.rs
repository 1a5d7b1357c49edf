//! Query side: keyword search and per-document status reports.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::index::Indexer;
use crate::models::{ClassificationResult, Document, Label, SearchHit, Task};
use crate::store;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub category: Option<Label>,
    pub limit: i64,
}

/// Run a keyword search against the index, optionally narrowed to one
/// category. Rejects a category string outside the closed label set
/// before it reaches the index.
pub async fn run_search(indexer: &dyn Indexer, req: &SearchRequest) -> Result<Vec<SearchHit>> {
    if req.query.trim().is_empty() {
        bail!("search query must not be empty");
    }
    let category = req.category.map(|l| l.as_str());
    let hits = indexer.search(&req.query, category, req.limit.max(1)).await?;
    Ok(hits)
}

pub fn parse_category(s: &str) -> Result<Label> {
    Label::from_str_opt(s).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown category '{}'; expected one of: {}",
            s,
            Label::ALL
                .iter()
                .map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    })
}

/// Everything known about one document, for `status` and `result`.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub document: Document,
    /// All tasks, newest first.
    pub tasks: Vec<Task>,
    /// Classification history, newest first.
    pub classifications: Vec<ClassificationResult>,
    pub indexed: bool,
}

pub async fn document_report(
    pool: &SqlitePool,
    content_hash: &str,
) -> Result<Option<DocumentReport>> {
    let Some(document) = store::get_document(pool, content_hash).await? else {
        return Ok(None);
    };
    let tasks = store::tasks_for_document(pool, content_hash).await?;
    let classifications = store::classification_history(pool, content_hash).await?;
    let indexed: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM index_entries WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_one(pool)
            .await?;
    Ok(Some(DocumentReport {
        document,
        tasks,
        classifications,
        indexed,
    }))
}

/// Look a task up by id and resolve it to its document's report.
pub async fn task_report(pool: &SqlitePool, task_id: &str) -> Result<Option<(Task, DocumentReport)>> {
    let Some(task) = store::get_task(pool, task_id).await? else {
        return Ok(None);
    };
    let report = document_report(pool, &task.content_hash).await?;
    Ok(report.map(|r| (task, r)))
}

/// Queue depth and task counts by stage, for `status` with no argument.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub documents: i64,
    pub pending_messages: i64,
    pub tasks_by_stage: Vec<(String, i64)>,
}

pub async fn system_status(pool: &SqlitePool) -> Result<SystemStatus> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let pending_messages = crate::queue::pending_count(pool).await?;
    let rows = sqlx::query(
        "SELECT current_stage, COUNT(*) AS n FROM tasks GROUP BY current_stage ORDER BY current_stage",
    )
    .fetch_all(pool)
    .await?;
    let tasks_by_stage = rows
        .iter()
        .map(|r| (r.get::<String, _>("current_stage"), r.get::<i64, _>("n")))
        .collect();
    Ok(SystemStatus {
        documents,
        pending_messages,
        tasks_by_stage,
    })
}

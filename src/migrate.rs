use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Uploaded documents, keyed by content hash (sha256 of raw bytes)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            content_hash TEXT PRIMARY KEY,
            format TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            original_filename TEXT,
            blob_path TEXT NOT NULL,
            received_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Orchestration tasks; versions captured at creation time
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            current_stage TEXT NOT NULL DEFAULT 'queued',
            feature_version TEXT NOT NULL,
            model_version TEXT NOT NULL,
            attempts_json TEXT NOT NULL DEFAULT '{}',
            last_error TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (content_hash) REFERENCES documents(content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one non-terminal task per document
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_active
        ON tasks(content_hash)
        WHERE current_stage NOT IN ('done', 'failed')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_content_hash ON tasks(content_hash)")
        .execute(pool)
        .await?;

    // Classification history: insert-only, one row per version triple
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classifications (
            content_hash TEXT NOT NULL,
            feature_version TEXT NOT NULL,
            model_version TEXT NOT NULL,
            label TEXT NOT NULL,
            confidence REAL NOT NULL,
            needs_review INTEGER NOT NULL,
            classified_at INTEGER NOT NULL,
            PRIMARY KEY (content_hash, feature_version, model_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable work queue; one coalesced message per content hash
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue (
            content_hash TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            available_at INTEGER NOT NULL,
            lease_until INTEGER,
            worker_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Index entry metadata; payload_hash makes re-indexing idempotent
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            content_hash TEXT PRIMARY KEY,
            payload_hash TEXT NOT NULL,
            label TEXT NOT NULL,
            confidence REAL NOT NULL,
            format TEXT NOT NULL,
            segment_count INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over indexed text
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='search_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE search_fts USING fts5(
                content_hash UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

//! Search index adapter.
//!
//! The pipeline talks to an [`Indexer`] trait; the built-in
//! [`SqliteIndexer`] keeps entry metadata in `index_entries` and the
//! searchable text in an FTS5 table. Indexing the same payload twice is a
//! no-op (keyed on a payload hash), and a changed payload for the same
//! document replaces the previous entry rather than duplicating it.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::error::StageError;
use crate::models::{now_ts, ClassificationResult, Document, ParsedContent, SearchHit};

/// Everything the index stores for one document.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub content_hash: String,
    pub text: String,
    pub label: String,
    pub confidence: f64,
    pub format: String,
    pub segment_count: i64,
}

impl IndexEntry {
    pub fn build(
        doc: &Document,
        parsed: &ParsedContent,
        classification: &ClassificationResult,
    ) -> Self {
        Self {
            content_hash: doc.content_hash.clone(),
            text: parsed.text.clone(),
            label: classification.label.as_str().to_string(),
            confidence: classification.confidence,
            format: doc.format.as_str().to_string(),
            segment_count: parsed.segments.len() as i64,
        }
    }

    /// Hash of the indexable payload; equal payloads index as a no-op.
    fn payload_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hasher.update(self.label.as_bytes());
        hasher.update(self.confidence.to_le_bytes());
        hasher.update(self.format.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Outcome of an upsert, mostly for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    Replaced,
    Unchanged,
}

#[async_trait]
pub trait Indexer: Send + Sync {
    /// Idempotent upsert of a document's entry.
    async fn upsert(&self, entry: &IndexEntry) -> Result<IndexOutcome, StageError>;

    /// Keyword search, optionally filtered to one category label.
    async fn search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchHit>, StageError>;
}

pub struct SqliteIndexer {
    pool: SqlitePool,
}

impl SqliteIndexer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Indexer for SqliteIndexer {
    async fn upsert(&self, entry: &IndexEntry) -> Result<IndexOutcome, StageError> {
        if entry.text.trim().is_empty() {
            return Err(StageError::IndexRejected(
                "entry has no searchable text".to_string(),
            ));
        }

        let payload_hash = entry.payload_hash();
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT payload_hash FROM index_entries WHERE content_hash = ?",
        )
        .bind(&entry.content_hash)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(prev) if prev == payload_hash => return Ok(IndexOutcome::Unchanged),
            Some(_) => {
                // Payload changed (e.g. reclassified): replace both rows
                sqlx::query("DELETE FROM search_fts WHERE content_hash = ?")
                    .bind(&entry.content_hash)
                    .execute(&self.pool)
                    .await?;
                sqlx::query(
                    "UPDATE index_entries SET payload_hash = ?, label = ?, confidence = ?,
                     format = ?, segment_count = ?, indexed_at = ? WHERE content_hash = ?",
                )
                .bind(&payload_hash)
                .bind(&entry.label)
                .bind(entry.confidence)
                .bind(&entry.format)
                .bind(entry.segment_count)
                .bind(now_ts())
                .bind(&entry.content_hash)
                .execute(&self.pool)
                .await?;
                sqlx::query("INSERT INTO search_fts (content_hash, text) VALUES (?, ?)")
                    .bind(&entry.content_hash)
                    .bind(&entry.text)
                    .execute(&self.pool)
                    .await?;
                Ok(IndexOutcome::Replaced)
            }
            None => {
                sqlx::query(
                    "INSERT INTO index_entries (content_hash, payload_hash, label, confidence,
                     format, segment_count, indexed_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&entry.content_hash)
                .bind(&payload_hash)
                .bind(&entry.label)
                .bind(entry.confidence)
                .bind(&entry.format)
                .bind(entry.segment_count)
                .bind(now_ts())
                .execute(&self.pool)
                .await?;
                sqlx::query("INSERT INTO search_fts (content_hash, text) VALUES (?, ?)")
                    .bind(&entry.content_hash)
                    .bind(&entry.text)
                    .execute(&self.pool)
                    .await?;
                Ok(IndexOutcome::Created)
            }
        }
    }

    async fn search(
        &self,
        query: &str,
        category: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchHit>, StageError> {
        // Quote each term so user input cannot inject FTS5 syntax
        let fts_query = query
            .split_whitespace()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" ");
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let sql = r#"
            SELECT f.content_hash AS content_hash,
                   e.label AS label,
                   e.confidence AS confidence,
                   e.format AS format,
                   bm25(search_fts) AS score,
                   snippet(search_fts, 1, '[', ']', '…', 12) AS snippet
            FROM search_fts f
            JOIN index_entries e ON e.content_hash = f.content_hash
            WHERE search_fts MATCH ?
              AND (? IS NULL OR e.label = ?)
            ORDER BY bm25(search_fts)
            LIMIT ?
        "#;

        let rows = sqlx::query(sql)
            .bind(&fts_query)
            .bind(category)
            .bind(category)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| SearchHit {
                content_hash: r.get("content_hash"),
                label: r.get("label"),
                confidence: r.get("confidence"),
                format: r.get("format"),
                score: r.get("score"),
                snippet: r.get("snippet"),
            })
            .collect())
    }
}

//! Durable at-least-once work queue backed by SQLite.
//!
//! One coalesced message per content hash: concurrent submissions of the
//! same bytes collapse onto a single row. Delivery uses leases instead of
//! consumer-held state, so a crashed worker's message reappears when its
//! lease expires. Acks delete; nacks push `available_at` into the future
//! for backoff. At-least-once holds because the lease fences redelivery
//! per key while still tolerating worker loss.

use sqlx::{Row, SqlitePool};

use crate::error::StageError;
use crate::models::now_ts;

/// A claimed unit of work. The lease belongs to `worker_id` until
/// `lease_until`.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub content_hash: String,
    pub task_id: String,
    pub attempt: u32,
}

/// Enqueue work for a content hash. If a message for the same hash is
/// already pending, this coalesces into it and reports false.
pub async fn enqueue(
    pool: &SqlitePool,
    content_hash: &str,
    task_id: &str,
) -> Result<bool, StageError> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        INSERT INTO queue (content_hash, task_id, enqueued_at, available_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(content_hash) DO NOTHING
        "#,
    )
    .bind(content_hash)
    .bind(task_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claim the next available message for `worker_id`, taking a lease of
/// `lease_secs`. A message is available when it has no live lease and its
/// `available_at` has passed; an expired lease makes it claimable again.
pub async fn dequeue(
    pool: &SqlitePool,
    worker_id: &str,
    lease_secs: u64,
) -> Result<Option<QueueMessage>, StageError> {
    let now = now_ts();
    let row = sqlx::query(
        r#"
        UPDATE queue
        SET lease_until = ?, worker_id = ?, attempt = attempt + 1
        WHERE content_hash = (
            SELECT content_hash FROM queue
            WHERE available_at <= ? AND (lease_until IS NULL OR lease_until <= ?)
            ORDER BY enqueued_at ASC
            LIMIT 1
        )
        RETURNING content_hash, task_id, attempt
        "#,
    )
    .bind(now + lease_secs as i64)
    .bind(worker_id)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| QueueMessage {
        content_hash: r.get("content_hash"),
        task_id: r.get("task_id"),
        attempt: r.get::<i64, _>("attempt") as u32,
    }))
}

/// Acknowledge a message after its work is durably recorded. Guarded on
/// the worker id so an expired-and-reclaimed message is not deleted by
/// the original, slow worker.
pub async fn ack(
    pool: &SqlitePool,
    content_hash: &str,
    worker_id: &str,
) -> Result<bool, StageError> {
    let result = sqlx::query("DELETE FROM queue WHERE content_hash = ? AND worker_id = ?")
        .bind(content_hash)
        .bind(worker_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Return a message to the queue, delayed by `delay_secs` for backoff.
pub async fn nack_with_delay(
    pool: &SqlitePool,
    content_hash: &str,
    worker_id: &str,
    delay_secs: u64,
) -> Result<(), StageError> {
    sqlx::query(
        "UPDATE queue SET lease_until = NULL, worker_id = NULL, available_at = ?
         WHERE content_hash = ? AND worker_id = ?",
    )
    .bind(now_ts() + delay_secs as i64)
    .bind(content_hash)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Messages not yet acked, including ones currently leased.
pub async fn pending_count(pool: &SqlitePool) -> Result<i64, StageError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;

    async fn pool() -> SqlitePool {
        // One connection: each pooled connection gets its own :memory: db
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn enqueue_coalesces_per_content_hash() {
        let pool = pool().await;
        assert!(enqueue(&pool, "h1", "t1").await.unwrap());
        assert!(!enqueue(&pool, "h1", "t1").await.unwrap());
        assert!(enqueue(&pool, "h2", "t2").await.unwrap());
        assert_eq!(pending_count(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dequeue_claims_and_fences_with_a_lease() {
        let pool = pool().await;
        enqueue(&pool, "h1", "t1").await.unwrap();

        let msg = dequeue(&pool, "w1", 60).await.unwrap().unwrap();
        assert_eq!(msg.content_hash, "h1");
        assert_eq!(msg.attempt, 1);

        // Leased: a second worker sees nothing
        assert!(dequeue(&pool, "w2", 60).await.unwrap().is_none());

        assert!(ack(&pool, "h1", "w1").await.unwrap());
        assert_eq!(pending_count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_and_old_ack_is_fenced() {
        let pool = pool().await;
        enqueue(&pool, "h1", "t1").await.unwrap();

        // Zero-length lease expires immediately
        let first = dequeue(&pool, "w1", 0).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);

        let second = dequeue(&pool, "w2", 60).await.unwrap().unwrap();
        assert_eq!(second.content_hash, "h1");
        assert_eq!(second.attempt, 2);

        // The original worker's ack must not delete w2's claim
        assert!(!ack(&pool, "h1", "w1").await.unwrap());
        assert!(ack(&pool, "h1", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn nack_delays_redelivery() {
        let pool = pool().await;
        enqueue(&pool, "h1", "t1").await.unwrap();

        let msg = dequeue(&pool, "w1", 60).await.unwrap().unwrap();
        nack_with_delay(&pool, &msg.content_hash, "w1", 3600)
            .await
            .unwrap();

        // Not yet available
        assert!(dequeue(&pool, "w1", 60).await.unwrap().is_none());
        assert_eq!(pending_count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn immediate_nack_allows_redelivery() {
        let pool = pool().await;
        enqueue(&pool, "h1", "t1").await.unwrap();

        let msg = dequeue(&pool, "w1", 60).await.unwrap().unwrap();
        nack_with_delay(&pool, &msg.content_hash, "w1", 0).await.unwrap();

        let again = dequeue(&pool, "w1", 60).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }
}

//! Stage orchestration: drives one queue message through
//! parse → extract → classify → index.
//!
//! The orchestrator owns all side effects (store transitions, cache
//! population, queue acks) so the stage implementations stay pure or
//! cache-transparent. Delivery is at-least-once: every mutation here is
//! idempotent or guarded, so a redelivered message converges instead of
//! corrupting state. The cancel flag is honored at stage boundaries only;
//! a stage that already started runs to completion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::cache::{ParsedKey, PredictionCache};
use crate::classify::ClassificationEngine;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::features::FeatureExtractor;
use crate::index::{IndexEntry, Indexer};
use crate::models::{Document, FeatureVector, ParsedContent, TaskStage};
use crate::parse::{self, PARSER_VERSION};
use crate::queue::{self, QueueMessage};
use crate::store;

/// What happened to a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Task ran to `Done`.
    Completed,
    /// Results for this version triple already existed; `Queued` → `Done`
    /// without running any stage.
    ShortCircuited,
    /// Retryable failure, message re-enqueued with backoff.
    Retrying {
        stage: TaskStage,
        attempt: u32,
        delay_secs: u64,
    },
    /// Terminal failure or exhausted attempt budget.
    Failed(String),
    /// Cancel flag observed at a stage boundary.
    Cancelled,
    /// Message referenced a missing or already-terminal task.
    Stale,
}

/// Exponential backoff in whole seconds: `base * 2^(attempt-1)`, capped.
/// Sub-second delays round down, so a small base retries immediately.
pub fn backoff_delay_secs(config: &PipelineConfig, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    let ms = config
        .backoff_base_ms
        .saturating_mul(1u64 << shift)
        .min(config.backoff_cap_ms);
    ms / 1000
}

pub struct Pipeline {
    pool: SqlitePool,
    cache: Arc<PredictionCache>,
    extractor: FeatureExtractor,
    engine: ClassificationEngine,
    indexer: Arc<dyn Indexer>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Wire up the standard pipeline: shared prediction cache, the
    /// configured feature extractor, the local linear model, and the
    /// SQLite-backed index.
    pub fn from_config(pool: SqlitePool, config: &crate::config::Config) -> Self {
        let cache = Arc::new(PredictionCache::new(&config.cache));
        let extractor = FeatureExtractor::new(&config.features, Arc::clone(&cache));
        let provider = Arc::new(crate::classify::LocalModelProvider::new(
            config.model.version.clone(),
            config.model.path.clone(),
        ));
        let engine =
            ClassificationEngine::new(provider, Arc::clone(&cache), config.model.review_threshold);
        let indexer = Arc::new(crate::index::SqliteIndexer::new(pool.clone()));
        Self::new(pool, cache, extractor, engine, indexer, config.pipeline.clone())
    }

    pub fn new(
        pool: SqlitePool,
        cache: Arc<PredictionCache>,
        extractor: FeatureExtractor,
        engine: ClassificationEngine,
        indexer: Arc<dyn Indexer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            extractor,
            engine,
            indexer,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Process one delivered message to an outcome. The message is acked
    /// here in every case except a retryable nack.
    pub async fn process(&self, msg: &QueueMessage, worker_id: &str) -> Result<ProcessOutcome> {
        let Some(task) = store::get_task(&self.pool, &msg.task_id).await? else {
            warn!(task_id = %msg.task_id, "queue message references unknown task");
            queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
            return Ok(ProcessOutcome::Stale);
        };
        if task.current_stage.is_terminal() {
            queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
            return Ok(ProcessOutcome::Stale);
        }

        let Some(doc) = store::get_document(&self.pool, &task.content_hash).await? else {
            store::record_failure(&self.pool, &task.task_id, "document record missing").await?;
            queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
            return Ok(ProcessOutcome::Failed("document record missing".to_string()));
        };

        // Submit refuses a new task when results already exist, but a
        // redelivered or raced message can still land here; complete it
        // without running any stage
        if task.current_stage == TaskStage::Queued && self.results_exist(&task).await? {
            if store::complete_short_circuit(&self.pool, &task.task_id).await? {
                info!(task_id = %task.task_id, content_hash = %task.content_hash,
                      "results already present, short-circuiting to done");
                queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
                return Ok(ProcessOutcome::ShortCircuited);
            }
        }

        match self.run_stages(&task, &doc).await {
            Ok(()) => {
                queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
                info!(task_id = %task.task_id, content_hash = %task.content_hash, "task completed");
                Ok(ProcessOutcome::Completed)
            }
            Err(StageError::Cancelled) => {
                store::record_failure(&self.pool, &task.task_id, "cancelled").await?;
                queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
                info!(task_id = %task.task_id, "task cancelled");
                Ok(ProcessOutcome::Cancelled)
            }
            Err(e) if e.is_terminal() => {
                let message = e.to_string();
                store::record_failure(&self.pool, &task.task_id, &message).await?;
                queue::ack(&self.pool, &msg.content_hash, worker_id).await?;
                warn!(task_id = %task.task_id, error = %message, "task failed terminally");
                Ok(ProcessOutcome::Failed(message))
            }
            Err(e) => self.handle_retryable(&task.task_id, &msg.content_hash, worker_id, e).await,
        }
    }

    async fn handle_retryable(
        &self,
        task_id: &str,
        content_hash: &str,
        worker_id: &str,
        error: StageError,
    ) -> Result<ProcessOutcome> {
        // The failing stage is wherever the task sits now; its attempt
        // count was bumped before the stage ran
        let Some(task) = store::get_task(&self.pool, task_id).await? else {
            queue::ack(&self.pool, content_hash, worker_id).await?;
            return Ok(ProcessOutcome::Stale);
        };
        let stage = task.current_stage;
        let attempt = task.attempts(stage);
        let message = error.to_string();

        if attempt >= self.config.max_attempts {
            let full = format!(
                "retry budget exhausted after {} attempts at {}: {}",
                attempt, stage, message
            );
            store::record_failure(&self.pool, task_id, &full).await?;
            queue::ack(&self.pool, content_hash, worker_id).await?;
            warn!(task_id = %task_id, stage = %stage, "retry budget exhausted");
            return Ok(ProcessOutcome::Failed(full));
        }

        let delay_secs = backoff_delay_secs(&self.config, attempt);
        store::record_retry_error(&self.pool, task_id, &message).await?;
        queue::nack_with_delay(&self.pool, content_hash, worker_id, delay_secs).await?;
        debug!(task_id = %task_id, stage = %stage, attempt, delay_secs, error = %message,
               "retryable failure, re-enqueued");
        Ok(ProcessOutcome::Retrying {
            stage,
            attempt,
            delay_secs,
        })
    }

    async fn results_exist(&self, task: &crate::models::Task) -> Result<bool> {
        store::results_complete(
            &self.pool,
            &task.content_hash,
            &task.feature_version,
            &task.model_version,
        )
        .await
    }

    async fn run_stages(
        &self,
        task: &crate::models::Task,
        doc: &Document,
    ) -> Result<(), StageError> {
        let mut stage = task.current_stage;
        loop {
            if store::cancel_requested(&self.pool, &task.task_id).await? {
                return Err(StageError::Cancelled);
            }
            match stage {
                TaskStage::Queued => {
                    self.advance(&task.task_id, TaskStage::Queued, TaskStage::Parsing)
                        .await?;
                }
                TaskStage::Parsing => {
                    store::bump_attempt(&self.pool, &task.task_id, stage).await?;
                    self.with_timeout(stage, self.ensure_parsed(doc)).await?;
                    self.advance(&task.task_id, stage, TaskStage::Extracting)
                        .await?;
                }
                TaskStage::Extracting => {
                    store::bump_attempt(&self.pool, &task.task_id, stage).await?;
                    self.with_timeout(stage, self.ensure_features(doc, &task.feature_version))
                        .await?;
                    self.advance(&task.task_id, stage, TaskStage::Classifying)
                        .await?;
                }
                TaskStage::Classifying => {
                    store::bump_attempt(&self.pool, &task.task_id, stage).await?;
                    let features = self.ensure_features(doc, &task.feature_version).await?;
                    let result = self
                        .with_timeout(stage, self.engine.classify(&features, &task.model_version))
                        .await?;
                    store::record_classification(&self.pool, &result).await?;
                    self.advance(&task.task_id, stage, TaskStage::Indexing)
                        .await?;
                }
                TaskStage::Indexing => {
                    store::bump_attempt(&self.pool, &task.task_id, stage).await?;
                    let parsed = self.ensure_parsed(doc).await?;
                    let classification = store::get_classification(
                        &self.pool,
                        &doc.content_hash,
                        &task.feature_version,
                        &task.model_version,
                    )
                    .await
                    .map_err(|e| StageError::Storage(e.to_string()))?
                    .ok_or_else(|| {
                        StageError::Storage("classification row missing before indexing".to_string())
                    })?;
                    let entry = IndexEntry::build(doc, &parsed, &classification);
                    self.with_timeout(stage, self.indexer.upsert(&entry)).await?;
                    self.advance(&task.task_id, stage, TaskStage::Done).await?;
                    return Ok(());
                }
                TaskStage::Done | TaskStage::Failed => return Ok(()),
            }
            stage = match stage.next() {
                Some(next) => next,
                None => return Ok(()),
            };
        }
    }

    async fn advance(
        &self,
        task_id: &str,
        from: TaskStage,
        to: TaskStage,
    ) -> Result<(), StageError> {
        let advanced = store::advance_stage(&self.pool, task_id, from, to).await?;
        if !advanced {
            // Someone else moved the task; back off and let redelivery sort it out
            return Err(StageError::Storage(format!(
                "stage transition {} -> {} lost a race",
                from, to
            )));
        }
        debug!(task_id = %task_id, from = %from, to = %to, "stage advanced");
        Ok(())
    }

    /// Parsed content for the document, from cache or by reading the blob.
    async fn ensure_parsed(&self, doc: &Document) -> Result<ParsedContent, StageError> {
        let key = ParsedKey {
            content_hash: doc.content_hash.clone(),
            parser_version: PARSER_VERSION.to_string(),
        };
        if let Some(cached) = self.cache.get_parsed(&key) {
            return Ok(cached);
        }
        let bytes = tokio::fs::read(&doc.blob_path).await?;
        let parsed = parse::parse_document(&doc.content_hash, &bytes, doc.format)?;
        self.cache.put_parsed(key, parsed.clone());
        Ok(parsed)
    }

    async fn ensure_features(
        &self,
        doc: &Document,
        feature_version: &str,
    ) -> Result<FeatureVector, StageError> {
        let parsed = self.ensure_parsed(doc).await?;
        self.extractor.extract(&parsed, feature_version)
    }

    async fn with_timeout<T, F>(&self, stage: TaskStage, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let budget = Duration::from_secs(self.config.stage_timeout_secs);
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                stage: stage.as_str().to_string(),
                secs: self.config.stage_timeout_secs,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, cap_ms: u64) -> PipelineConfig {
        PipelineConfig {
            backoff_base_ms: base_ms,
            backoff_cap_ms: cap_ms,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = config(1000, 8000);
        assert_eq!(backoff_delay_secs(&cfg, 1), 1);
        assert_eq!(backoff_delay_secs(&cfg, 2), 2);
        assert_eq!(backoff_delay_secs(&cfg, 3), 4);
        assert_eq!(backoff_delay_secs(&cfg, 4), 8);
        assert_eq!(backoff_delay_secs(&cfg, 5), 8);
        assert_eq!(backoff_delay_secs(&cfg, 50), 8);
    }

    #[test]
    fn sub_second_backoff_rounds_down() {
        let cfg = config(100, 60_000);
        assert_eq!(backoff_delay_secs(&cfg, 1), 0);
        assert_eq!(backoff_delay_secs(&cfg, 4), 0);
        assert_eq!(backoff_delay_secs(&cfg, 5), 1);
    }
}

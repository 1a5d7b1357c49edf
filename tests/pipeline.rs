//! End-to-end pipeline scenarios driven through the public library API:
//! submit real bytes, process them through every stage, and check what
//! the store, index, and queue say afterwards.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use findex::cache::PredictionCache;
use findex::classify::{ClassificationEngine, ModelProvider};
use findex::config::{
    CacheConfig, Config, DbConfig, FeaturesConfig, ModelConfig, PipelineConfig, StorageConfig,
};
use findex::error::StageError;
use findex::features::FeatureExtractor;
use findex::index::{Indexer, SqliteIndexer};
use findex::ingest::{self, SubmitOutcome};
use findex::models::{FeatureVector, Label, TaskStage};
use findex::pipeline::{Pipeline, ProcessOutcome};
use findex::{db, migrate, queue, store};

const SNAPSHOT: &str = r#"{
    "version": "linear-v1",
    "labels": {
        "financial-report": { "bias": 0.0, "weights": { "revenue": 8.0, "earnings": 8.0, "profit": 8.0, "quarter": 8.0 } },
        "contract": { "bias": 0.0, "weights": { "agreement": 8.0, "party": 8.0 } },
        "invoice": { "bias": 0.0, "weights": { "invoice": 8.0, "amount": 8.0, "due": 8.0 } },
        "other": { "bias": 0.5, "weights": {} }
    }
}"#;

struct Env {
    _tmp: TempDir,
    config: Config,
    root: PathBuf,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    std::fs::write(root.join("model.json"), SNAPSHOT).unwrap();

    let config = Config {
        db: DbConfig {
            path: root.join("data/findex.sqlite"),
        },
        storage: StorageConfig {
            blob_dir: root.join("blobs"),
            max_upload_bytes: 10 * 1024 * 1024,
        },
        pipeline: PipelineConfig {
            max_attempts: 5,
            // Sub-second base rounds to zero delay, so retries are immediate
            backoff_base_ms: 1,
            backoff_cap_ms: 1000,
            stage_timeout_secs: 30,
            poll_interval_ms: 10,
            lease_secs: 60,
            workers: 1,
        },
        features: FeaturesConfig {
            version: "tfidf-v1".to_string(),
            min_token_len: 2,
        },
        model: ModelConfig {
            version: "linear-v1".to_string(),
            path: root.join("model.json"),
            review_threshold: 0.5,
        },
        cache: CacheConfig::default(),
    };

    Env {
        _tmp: tmp,
        config,
        root,
    }
}

async fn connect(env: &Env) -> sqlx::SqlitePool {
    let pool = db::connect(&env.config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    pool
}

fn docx_fixture(env: &Env, name: &str, paragraphs: &[&str]) -> PathBuf {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    let path = env.root.join(name);
    std::fs::write(&path, buf).unwrap();
    path
}

fn report_docx(env: &Env, name: &str) -> PathBuf {
    docx_fixture(
        env,
        name,
        &[
            "Quarterly revenue rose sharply compared to last year.",
            "Earnings per share beat expectations for the quarter.",
            "Net profit margins expanded across all segments.",
        ],
    )
}

/// Minimal single-page PDF with a byte-accurate xref table.
fn pdf_fixture(env: &Env, name: &str, line: &str) -> PathBuf {
    let stream = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET\n", line);
    let objects = [
        "1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n".to_string(),
        "2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n".to_string(),
        "3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n".to_string(),
        format!(
            "4 0 obj << /Length {} >> stream\n{}endstream endobj\n",
            stream.len(),
            stream
        ),
        "5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n".to_string(),
    ];
    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for obj in &objects {
        offsets.push(out.len());
        out.extend_from_slice(obj.as_bytes());
    }
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size 6 /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            xref_start
        )
        .as_bytes(),
    );
    let path = env.root.join(name);
    std::fs::write(&path, out).unwrap();
    path
}

#[tokio::test]
async fn pdf_report_flows_to_done_and_is_searchable() {
    let env = setup();
    let pool = connect(&env).await;
    let path = pdf_fixture(
        &env,
        "report.pdf",
        "Quarterly revenue and earnings beat profit forecasts",
    );

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let SubmitOutcome::Enqueued {
        content_hash,
        task_id,
    } = outcome
    else {
        panic!("expected a new task");
    };

    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(pipeline, &content_hash).await.unwrap();
    assert_eq!(result, ProcessOutcome::Completed);

    let task = store::get_task(&pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Done);

    let classification = store::get_classification(&pool, &content_hash, "tfidf-v1", "linear-v1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(classification.label, Label::FinancialReport);

    let indexer = SqliteIndexer::new(pool.clone());
    let hits = indexer.search("earnings", None, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content_hash, content_hash);
}

#[tokio::test]
async fn financial_report_flows_to_done_and_is_searchable() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let SubmitOutcome::Enqueued {
        content_hash,
        task_id,
    } = outcome
    else {
        panic!("expected a new task");
    };

    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(pipeline, &content_hash).await.unwrap();
    assert_eq!(result, ProcessOutcome::Completed);

    let task = store::get_task(&pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Done);
    // Happy path: exactly one attempt per stage
    for stage in [
        TaskStage::Parsing,
        TaskStage::Extracting,
        TaskStage::Classifying,
        TaskStage::Indexing,
    ] {
        assert_eq!(task.attempts(stage), 1, "stage {}", stage);
    }

    let classification = store::get_classification(&pool, &content_hash, "tfidf-v1", "linear-v1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(classification.label, Label::FinancialReport);
    assert!(
        classification.confidence >= 0.6,
        "confidence was {}",
        classification.confidence
    );
    assert!(!classification.needs_review);

    let indexer = SqliteIndexer::new(pool.clone());
    let hits = indexer.search("revenue", None, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content_hash, content_hash);
    assert_eq!(hits[0].label, "financial-report");

    // Everything acked
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn corrupt_document_fails_terminally_without_retries() {
    let env = setup();
    let pool = connect(&env).await;
    let path = env.root.join("broken.docx");
    std::fs::write(&path, b"this is not a zip archive").unwrap();

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let content_hash = outcome.content_hash().to_string();
    let task_id = outcome.task_id().unwrap().to_string();

    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(pipeline, &content_hash).await.unwrap();
    assert!(matches!(result, ProcessOutcome::Failed(_)));

    let task = store::get_task(&pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Failed);
    assert!(task.last_error.as_deref().unwrap_or("").contains("corrupt"));
    // Terminal on the first parsing attempt; no retries burned
    assert_eq!(task.attempts(TaskStage::Parsing), 1);
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_document_fails_terminally() {
    let env = setup();
    let pool = connect(&env).await;
    let path = env.root.join("empty.html");
    std::fs::write(&path, b"<html><body><script>var x = 1;</script></body></html>").unwrap();

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(pipeline, outcome.content_hash())
        .await
        .unwrap();
    assert!(matches!(result, ProcessOutcome::Failed(_)));

    let task = store::get_task(&pool, outcome.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Failed);
    assert!(task
        .last_error
        .as_deref()
        .unwrap_or("")
        .contains("no extractable text"));
}

/// Fails a fixed number of predictions with a retryable error, then
/// answers normally.
struct FlakyProvider {
    failures_left: AtomicU32,
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    fn version(&self) -> &str {
        "linear-v1"
    }

    async fn predict(&self, _features: &FeatureVector) -> Result<(Label, f64), StageError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StageError::ModelUnavailable("snapshot not ready".to_string()));
        }
        Ok((Label::FinancialReport, 0.9))
    }
}

fn pipeline_with_provider(
    pool: &sqlx::SqlitePool,
    config: &Config,
    provider: Arc<dyn ModelProvider>,
) -> Pipeline {
    let cache = Arc::new(PredictionCache::new(&config.cache));
    let extractor = FeatureExtractor::new(&config.features, Arc::clone(&cache));
    let engine = ClassificationEngine::new(provider, Arc::clone(&cache), config.model.review_threshold);
    let indexer = Arc::new(SqliteIndexer::new(pool.clone()));
    Pipeline::new(
        pool.clone(),
        cache,
        extractor,
        engine,
        indexer,
        config.pipeline.clone(),
    )
}

#[tokio::test]
async fn transient_model_outage_retries_then_succeeds() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let pipeline = Arc::new(pipeline_with_provider(
        &pool,
        &env.config,
        Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(2),
        }),
    ));

    let result = ingest::process_inline(pipeline, outcome.content_hash())
        .await
        .unwrap();
    assert_eq!(result, ProcessOutcome::Completed);

    let task = store::get_task(&pool, outcome.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Done);
    // Two failures plus the success
    assert_eq!(task.attempts(TaskStage::Classifying), 3);
    // Earlier stages were not re-run from scratch
    assert_eq!(task.attempts(TaskStage::Parsing), 1);
}

#[tokio::test]
async fn persistent_outage_exhausts_the_attempt_budget() {
    let mut env = setup();
    env.config.pipeline.max_attempts = 3;
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let pipeline = Arc::new(pipeline_with_provider(
        &pool,
        &env.config,
        Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(u32::MAX),
        }),
    ));

    let result = ingest::process_inline(pipeline, outcome.content_hash())
        .await
        .unwrap();
    assert!(matches!(result, ProcessOutcome::Failed(_)));

    let task = store::get_task(&pool, outcome.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Failed);
    assert_eq!(task.attempts(TaskStage::Classifying), 3);
    assert!(task
        .last_error
        .as_deref()
        .unwrap_or("")
        .contains("retry budget exhausted"));
}

#[tokio::test]
async fn duplicate_submits_coalesce_onto_one_task() {
    let env = setup();
    let pool = connect(&env).await;
    let a = report_docx(&env, "a.docx");
    let b = report_docx(&env, "b.docx"); // same bytes, different name

    let first = ingest::submit(&pool, &env.config, &a, None).await.unwrap();
    let second = ingest::submit(&pool, &env.config, &b, None).await.unwrap();

    assert!(matches!(first, SubmitOutcome::Enqueued { .. }));
    match &second {
        SubmitOutcome::Coalesced { task_id, .. } => assert_eq!(Some(task_id.as_str()), first.task_id()),
        other => panic!("expected coalescing, got {:?}", other),
    }
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 1);

    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(pipeline, first.content_hash())
        .await
        .unwrap();
    assert_eq!(result, ProcessOutcome::Completed);

    let tasks = store::tasks_for_document(&pool, first.content_hash())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn reupload_of_processed_content_completes_at_submit() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let first = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    ingest::process_inline(pipeline, first.content_hash())
        .await
        .unwrap();

    // Same bytes again: results already exist at these versions, so
    // submit answers without creating a task or touching the queue
    let second = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    assert_eq!(
        second,
        SubmitOutcome::AlreadyComplete {
            content_hash: first.content_hash().to_string()
        }
    );
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 0);

    let tasks = store::tasks_for_document(&pool, first.content_hash())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn redelivered_message_for_completed_content_short_circuits() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let first = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    ingest::process_inline(Arc::clone(&pipeline), first.content_hash())
        .await
        .unwrap();

    // A raced submit can still create a task after results exist; its
    // message completes without running any stage
    let task_id = "raced-task".to_string();
    store::create_task(&pool, &task_id, first.content_hash(), "tfidf-v1", "linear-v1")
        .await
        .unwrap();
    queue::enqueue(&pool, first.content_hash(), &task_id).await.unwrap();

    let result = ingest::process_inline(pipeline, first.content_hash())
        .await
        .unwrap();
    assert_eq!(result, ProcessOutcome::ShortCircuited);

    let task = store::get_task(&pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Done);
    assert!(task.attempt_counts.is_empty(), "no stage should have run");
}

#[tokio::test]
async fn cancel_before_processing_fails_the_task() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    assert!(store::request_cancel(&pool, outcome.task_id().unwrap()).await.unwrap());

    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(pipeline, outcome.content_hash())
        .await
        .unwrap();
    assert_eq!(result, ProcessOutcome::Cancelled);

    let task = store::get_task(&pool, outcome.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Failed);
    assert_eq!(task.last_error.as_deref(), Some("cancelled"));
}

/// Requests cancellation of its own task from inside the prediction call,
/// then answers normally.
struct CancelDuringPredict {
    pool: sqlx::SqlitePool,
    task_id: String,
}

#[async_trait]
impl ModelProvider for CancelDuringPredict {
    fn version(&self) -> &str {
        "linear-v1"
    }

    async fn predict(&self, _features: &FeatureVector) -> Result<(Label, f64), StageError> {
        store::request_cancel(&self.pool, &self.task_id)
            .await
            .map_err(|e| StageError::Storage(e.to_string()))?;
        Ok((Label::FinancialReport, 0.9))
    }
}

#[tokio::test]
async fn cancel_during_a_stage_finishes_it_before_failing_the_task() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let task_id = outcome.task_id().unwrap().to_string();
    let pipeline = Arc::new(pipeline_with_provider(
        &pool,
        &env.config,
        Arc::new(CancelDuringPredict {
            pool: pool.clone(),
            task_id: task_id.clone(),
        }),
    ));

    let result = ingest::process_inline(pipeline, outcome.content_hash())
        .await
        .unwrap();
    assert_eq!(result, ProcessOutcome::Cancelled);

    // The in-flight classifying stage ran to completion and its result
    // was recorded before the flag was honored
    let classification =
        store::get_classification(&pool, outcome.content_hash(), "tfidf-v1", "linear-v1")
            .await
            .unwrap();
    assert!(classification.is_some());

    // Indexing never started
    let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(indexed, 0);

    let task = store::get_task(&pool, &task_id).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Failed);
    assert_eq!(task.last_error.as_deref(), Some("cancelled"));
    assert_eq!(queue::pending_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn requeue_after_failure_starts_a_fresh_task() {
    let mut env = setup();
    env.config.pipeline.max_attempts = 1;
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let first = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let broken = Arc::new(pipeline_with_provider(
        &pool,
        &env.config,
        Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(u32::MAX),
        }),
    ));
    let result = ingest::process_inline(broken, first.content_hash())
        .await
        .unwrap();
    assert!(matches!(result, ProcessOutcome::Failed(_)));

    // Model recovers; requeue produces a new task that runs to done
    let new_task_id = ingest::requeue(&pool, &env.config, first.content_hash())
        .await
        .unwrap();
    assert_ne!(Some(new_task_id.as_str()), first.task_id());

    let healthy = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let result = ingest::process_inline(healthy, first.content_hash())
        .await
        .unwrap();
    assert_eq!(result, ProcessOutcome::Completed);

    let task = store::get_task(&pool, &new_task_id).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Done);

    // The failed task's history is untouched
    let old = store::get_task(&pool, first.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(old.current_stage, TaskStage::Failed);
}

#[tokio::test]
async fn requeue_rejects_in_flight_documents() {
    let env = setup();
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let err = ingest::requeue(&pool, &env.config, outcome.content_hash()).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn expired_lease_lets_another_worker_finish_the_task() {
    let mut env = setup();
    env.config.pipeline.lease_secs = 0;
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();

    // First worker claims with an instantly-expiring lease and then dies
    let claimed = queue::dequeue(&pool, "w-crashed", 0).await.unwrap();
    assert!(claimed.is_some());

    // A second worker reclaims and completes the task
    let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &env.config));
    let msg = queue::dequeue(&pool, "w-survivor", 60).await.unwrap().unwrap();
    assert_eq!(msg.attempt, 2);
    let result = pipeline.process(&msg, "w-survivor").await.unwrap();
    assert_eq!(result, ProcessOutcome::Completed);

    let task = store::get_task(&pool, outcome.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Done);
}

#[tokio::test]
async fn slow_stage_times_out_as_retryable() {
    let mut env = setup();
    env.config.pipeline.stage_timeout_secs = 1;
    let pool = connect(&env).await;
    let path = report_docx(&env, "report.docx");

    struct SlowProvider;
    #[async_trait]
    impl ModelProvider for SlowProvider {
        fn version(&self) -> &str {
            "linear-v1"
        }
        async fn predict(&self, _f: &FeatureVector) -> Result<(Label, f64), StageError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok((Label::Other, 0.5))
        }
    }

    let outcome = ingest::submit(&pool, &env.config, &path, None).await.unwrap();
    let pipeline = pipeline_with_provider(&pool, &env.config, Arc::new(SlowProvider));

    let msg = queue::dequeue(&pool, "w1", 60).await.unwrap().unwrap();
    let result = pipeline.process(&msg, "w1").await.unwrap();
    match result {
        ProcessOutcome::Retrying { stage, attempt, .. } => {
            assert_eq!(stage, TaskStage::Classifying);
            assert_eq!(attempt, 1);
        }
        other => panic!("expected a retry, got {:?}", other),
    }

    let task = store::get_task(&pool, outcome.task_id().unwrap()).await.unwrap().unwrap();
    assert_eq!(task.current_stage, TaskStage::Classifying);
    assert!(task.last_error.as_deref().unwrap_or("").contains("timed out"));
}

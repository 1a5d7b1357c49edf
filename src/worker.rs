//! Worker pool: polls the queue and feeds messages to the pipeline.
//!
//! Each worker claims at most one message at a time under its own lease,
//! so parallelism across documents never becomes parallelism within one
//! document. Shutdown is graceful: on ctrl-c (or when draining an empty
//! queue) workers finish their in-flight message before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::pipeline::Pipeline;
use crate::queue;

/// Run `count` workers until shutdown. With `drain` set, workers stop as
/// soon as the queue is empty instead of idling.
pub async fn run_workers(pipeline: Arc<Pipeline>, config: &PipelineConfig, drain: bool) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(config.workers);
    for n in 0..config.workers {
        let pipeline = Arc::clone(&pipeline);
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(pipeline, config, shutdown, drain, n).await
        }));
    }
    drop(shutdown_rx);

    if drain {
        // Drain mode has a natural end; no signal handling needed
        for handle in handles {
            handle.await??;
        }
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, letting workers finish in-flight work");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        handle.await??;
    }
    info!("all workers stopped");
    Ok(())
}

async fn worker_loop(
    pipeline: Arc<Pipeline>,
    config: PipelineConfig,
    shutdown: watch::Receiver<bool>,
    drain: bool,
    n: usize,
) -> Result<()> {
    let worker_id = format!("worker-{}-{}", n, Uuid::new_v4());
    info!(worker_id = %worker_id, "worker started");
    let poll_interval = Duration::from_millis(config.poll_interval_ms);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue::dequeue(pipeline.pool(), &worker_id, config.lease_secs).await {
            Ok(Some(msg)) => {
                debug!(worker_id = %worker_id, content_hash = %msg.content_hash,
                       attempt = msg.attempt, "claimed message");
                if let Err(e) = pipeline.process(&msg, &worker_id).await {
                    // Infrastructure failure: the lease expires and the
                    // message is redelivered, so just log and move on
                    error!(worker_id = %worker_id, content_hash = %msg.content_hash,
                           error = %e, "processing aborted");
                }
            }
            Ok(None) => {
                if drain && queue::pending_count(pipeline.pool()).await? == 0 {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "dequeue failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    info!(worker_id = %worker_id, "worker stopped");
    Ok(())
}

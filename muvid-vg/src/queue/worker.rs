//! Worker loop
//!
//! Long-lived tasks that dequeue from the named queues and dispatch by
//! job kind. The clip-generation queue is polled first so interactive
//! generation work is not starved by long compositions.

use super::WorkerContext;
use crate::models::{JobKind, JobRecord};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run one worker until shutdown
pub async fn run_worker(ctx: WorkerContext, worker_id: usize, shutdown: CancellationToken) {
    let queues = [ctx.config.clip_queue(), ctx.config.default_queue()];
    let poll_interval = Duration::from_millis(ctx.config.workers.poll_interval_ms.max(50));

    tracing::info!(worker_id, queues = ?queues, "Worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let mut worked = false;
        for queue in &queues {
            match crate::db::jobs::claim_next(&ctx.db, queue).await {
                Ok(Some(job)) => {
                    worked = true;
                    dispatch(&ctx, job).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker_id, queue = %queue, error = %e, "Queue claim failed");
                }
            }
        }

        if !worked {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    tracing::info!(worker_id, "Worker stopped");
}

/// Execute one claimed job
async fn dispatch(ctx: &WorkerContext, job: JobRecord) {
    let job_id = job.id;
    let kind = job.kind;
    let token = ctx.cancellations.register(job_id).await;

    tracing::debug!(job_id = %job_id, kind = kind.as_str(), attempt = job.attempt, "Dispatching job");

    let result = match kind {
        JobKind::Analyze => crate::analysis::run_analysis_job(ctx, &job, &token).await,
        JobKind::ClipGenerate => crate::clips::run_clip_job(ctx, &job, &token).await,
        JobKind::ClipBatch => crate::clips::run_batch_job(ctx, &job, &token).await,
        JobKind::Compose => crate::compose::run_composition_job(ctx, &job, &token).await,
    };

    if let Err(e) = result {
        // Unexpected internal failure; the job kinds record their own
        // domain failures before returning Ok
        let trace_id = uuid::Uuid::new_v4();
        tracing::error!(
            job_id = %job_id,
            kind = kind.as_str(),
            trace_id = %trace_id,
            error = ?e,
            "Job crashed with internal error"
        );
        let message = format!("internal error (trace {trace_id})");
        if let Err(e) = crate::db::jobs::mark_failed(&ctx.db, job_id, &message).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
    }

    ctx.cancellations.remove(job_id).await;
}

/// Periodically return expired claims to their queues
pub async fn run_reaper(ctx: WorkerContext, shutdown: CancellationToken) {
    let interval = Duration::from_secs(30);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match crate::db::jobs::reap_expired(&ctx.db).await {
            Ok(0) => {}
            Ok(reaped) => tracing::warn!(reaped, "Returned expired job claims to queue"),
            Err(e) => tracing::warn!(error = %e, "Job reaper pass failed"),
        }
    }
}

/// Periodically sweep orphaned blobs
pub async fn run_blob_sweeper(ctx: WorkerContext, shutdown: CancellationToken) {
    let interval = Duration::from_secs(3600);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match crate::storage::sweep_orphans(&ctx.db, &ctx.blobs).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Blob sweeper removed orphans"),
            Err(e) => tracing::warn!(error = %e, "Blob sweeper pass failed"),
        }
    }
}

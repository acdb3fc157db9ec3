//! Worker loop: lease a job, run its handler under cancellation and
//! deadline, classify the outcome.
//!
//! Transient failures retry with exponential backoff and full jitter up to
//! the attempt budget. Cancelled jobs do not consume retry budget. A fatal
//! error marks the queue so the supervisor stops scaling up.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::AppError;
use crate::queue::queue::LeasedJob;
use crate::queue::supervisor::PoolStats;
use crate::queue::{JobContext, JobHandler, JobQueue};

/// Backoff before retry attempt `attempts + 1`: full jitter over an
/// exponentially growing window (1 s, 2 s, 4 s, capped at 30 s).
fn retry_delay(attempts: u32) -> Duration {
    let cap_ms = 30_000u64;
    let window_ms = (1000u64 << attempts.min(5)).min(cap_ms);
    let jittered = rand::thread_rng().gen_range(0..=window_ms);
    Duration::from_millis(jittered)
}

pub fn spawn_worker(
    index: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    stats: Arc<PoolStats>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Worker {index} started");
        loop {
            let Some(lease) = queue.next_job(&shutdown).await else {
                break;
            };
            stats.begin_job();
            run_one(&queue, handler.as_ref(), lease).await;
            stats.end_job();
        }
        info!("Worker {index} stopped");
    })
}

enum Outcome {
    Done(Result<serde_json::Value, AppError>),
    Cancelled,
    DeadlinePassed,
}

async fn run_one(queue: &Arc<JobQueue>, handler: &dyn JobHandler, lease: LeasedJob) {
    let job = lease.job.clone();
    let ctx = JobContext::new(
        job.id,
        lease.cancel.clone(),
        queue.clone(),
        lease.resume_from.clone(),
    );

    let work = handler.handle(&job, &ctx);
    let outcome = match lease.deadline {
        Some(deadline) => {
            tokio::select! {
                _ = lease.cancel.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Outcome::DeadlinePassed,
                result = work => Outcome::Done(result),
            }
        }
        None => {
            tokio::select! {
                _ = lease.cancel.cancelled() => Outcome::Cancelled,
                result = work => Outcome::Done(result),
            }
        }
    };

    match outcome {
        Outcome::Done(Ok(result)) => {
            queue.complete(job.id, result).await;
        }
        Outcome::Cancelled => {
            info!("Job {} cancelled", job.id);
            queue.mark_cancelled(job.id).await;
        }
        Outcome::DeadlinePassed => {
            warn!("Job {} ran past its deadline", job.id);
            queue.mark_cancelled(job.id).await;
        }
        Outcome::Done(Err(e)) if e.is_fatal() => {
            error!("Job {} hit a fatal condition: {e}", job.id);
            queue.set_fatal();
            queue.fail_terminal(job.id, e.to_string()).await;
        }
        Outcome::Done(Err(e)) if e.is_transient() && job.attempts + 1 < queue.max_attempts() => {
            let delay = retry_delay(job.attempts);
            warn!(
                "Job {} failed transiently ({e}), retry in {}ms",
                job.id,
                delay.as_millis()
            );
            queue.clone().requeue_after(job, delay);
        }
        Outcome::Done(Err(e)) => {
            warn!("Job {} failed terminally: {e}", job.id);
            queue.fail_terminal(job.id, e.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Job, JobKind, JobStatus, Priority, QueueConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        failures_before_success: u32,
        calls: AtomicU32,
        error: fn() -> AppError,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(
            &self,
            _job: &Job,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err((self.error)())
            } else {
                Ok(json!({"done": true}))
            }
        }
    }

    async fn wait_for_terminal(queue: &JobQueue, id: uuid::Uuid) -> JobStatus {
        for _ in 0..500 {
            if let Some(record) = queue.record(id) {
                if record.status.is_terminal() {
                    return record.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    fn setup(handler: Arc<dyn JobHandler>) -> (Arc<JobQueue>, CancellationToken) {
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), None));
        let shutdown = CancellationToken::new();
        spawn_worker(
            0,
            queue.clone(),
            handler,
            Arc::new(PoolStats::new()),
            shutdown.clone(),
        );
        (queue, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_to_success() {
        let handler = Arc::new(FlakyHandler {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
            error: || AppError::EmbedderUnavailable("down".into()),
        });
        let (queue, shutdown) = setup(handler.clone());

        let id = queue
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Succeeded);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted_fails() {
        let handler = Arc::new(FlakyHandler {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            error: || AppError::ExtractorThrottled,
        });
        let (queue, shutdown) = setup(handler.clone());

        let id = queue
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Failed);
        // Three attempts total: the default budget.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_error_never_retried() {
        let handler = Arc::new(FlakyHandler {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            error: || AppError::Corrupt("bad file".into()),
        });
        let (queue, shutdown) = setup(handler.clone());

        let id = queue
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_marks_queue() {
        let handler = Arc::new(FlakyHandler {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
            error: || AppError::DimMismatch {
                expected: 768,
                got: 384,
            },
        });
        let (queue, shutdown) = setup(handler);

        let id = queue
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Failed);
        assert!(queue.fatal());
        shutdown.cancel();
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(
            &self,
            _job: &Job,
            ctx: &JobContext,
        ) -> Result<serde_json::Value, AppError> {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(AppError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(json!({})),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_job_cancellable() {
        let (queue, shutdown) = setup(Arc::new(SlowHandler));
        let id = queue
            .submit(JobKind::BulkMatch, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap();
        // Give the worker a moment to lease, then cancel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.cancel_job(id);
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Cancelled);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_running_job() {
        let (queue, shutdown) = setup(Arc::new(SlowHandler));
        let id = queue
            .submit(
                JobKind::BulkMatch,
                Priority::Normal,
                json!({}),
                "k".into(),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Cancelled);
        shutdown.cancel();
    }

    #[test]
    fn test_retry_delay_within_window() {
        for attempts in 0..6 {
            let d = retry_delay(attempts);
            assert!(d <= Duration::from_millis(30_000));
        }
    }
}

//! The queue proper: four priority lanes, an idempotency window, durable
//! submission, and the maintenance pass (aging, deadlines, pruning).

use serde_json::Value;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::queue::{Job, JobKind, JobRecord, JobStatus, Priority};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Submissions above this depth are rejected with back-pressure.
    pub qmax: usize,
    /// Duplicate `idem_key` submissions are refused within this window.
    pub idem_window: Duration,
    /// Attempts per job including the first.
    pub max_attempts: u32,
    /// A job climbs one priority level per this much wait past its SLA.
    pub aging_step: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            qmax: 5000,
            idem_window: Duration::from_secs(24 * 60 * 60),
            max_attempts: 3,
            aging_step: Duration::from_secs(60),
        }
    }
}

struct QueuedJob {
    job: Job,
    lane: usize,
    enqueued: Instant,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

/// A job leased to a worker, with its cancellation token and deadline.
pub struct LeasedJob {
    pub job: Job,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    pub resume_from: Option<String>,
}

pub struct JobQueue {
    lanes: Mutex<[VecDeque<QueuedJob>; Priority::COUNT]>,
    notify: Notify,
    registry: Mutex<HashMap<Uuid, JobRecord>>,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    idem: Mutex<HashMap<String, (Uuid, Instant)>>,
    fatal: AtomicBool,
    mem_gate: AtomicBool,
    persist: Option<PgPool>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(config: QueueConfig, persist: Option<PgPool>) -> Self {
        Self {
            lanes: Mutex::new(Default::default()),
            notify: Notify::new(),
            registry: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            idem: Mutex::new(HashMap::new()),
            fatal: AtomicBool::new(false),
            mem_gate: AtomicBool::new(false),
            persist,
            config,
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes.lock().unwrap().iter().map(VecDeque::len).sum()
    }

    pub fn fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::Relaxed);
    }

    pub fn set_mem_gate(&self, gated: bool) {
        self.mem_gate.store(gated, Ordering::Relaxed);
    }

    /// Submits a job. Rejections: back-pressure above `Qmax` or while the
    /// memory gate is closed, and 24 h idempotency collisions (which carry
    /// the prior job id).
    pub async fn submit(
        &self,
        kind: JobKind,
        priority: Priority,
        payload: Value,
        idem_key: String,
        deadline: Option<Duration>,
    ) -> Result<Uuid, AppError> {
        let depth = self.depth();
        if self.mem_gate.load(Ordering::Relaxed) || depth >= self.config.qmax {
            return Err(AppError::BackPressure { depth });
        }

        // Reserve the key before anything else; a duplicate racing this
        // submit must lose even before the job is enqueued.
        let id = {
            let mut idem = self.idem.lock().unwrap();
            let now = Instant::now();
            idem.retain(|_, (_, seen)| now.duration_since(*seen) < self.config.idem_window);
            if let Some((prior, _)) = idem.get(&idem_key) {
                return Err(AppError::IdempotencyCollision { prior_job_id: *prior });
            }
            let id = Uuid::new_v4();
            idem.insert(idem_key.clone(), (id, now));
            id
        };

        let job = Job {
            id,
            kind,
            priority,
            payload,
            idem_key,
            attempts: 0,
            created_at: chrono::Utc::now(),
            deadline_ms: deadline.map(|d| d.as_millis() as u64),
        };

        if let Some(pool) = &self.persist {
            if let Err(e) = persist_insert(pool, &job).await {
                // Release the reserved key; the submission never happened.
                self.idem.lock().unwrap().remove(&job.idem_key);
                return Err(e);
            }
        }

        self.enqueue(job, None);
        Ok(id)
    }

    /// Pushes a job into its lane and registers it. `resume_from` survives
    /// restarts so the handler can skip completed steps.
    pub(crate) fn enqueue(&self, job: Job, resume_from: Option<String>) {
        let cancel = CancellationToken::new();
        let deadline = job
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        self.tokens.lock().unwrap().insert(job.id, cancel.clone());
        {
            // A retry keeps the checkpoint it reached on the prior attempt.
            let mut registry = self.registry.lock().unwrap();
            let checkpoint = resume_from.or_else(|| {
                registry
                    .get(&job.id)
                    .and_then(|record| record.checkpoint.clone())
            });
            registry.insert(
                job.id,
                JobRecord {
                    job: job.clone(),
                    status: JobStatus::Queued,
                    checkpoint,
                    error: None,
                    result: None,
                },
            );
        }

        let lane = job.priority.lane();
        self.lanes.lock().unwrap()[lane].push_back(QueuedJob {
            job,
            lane,
            enqueued: Instant::now(),
            deadline,
            cancel,
        });
        self.notify.notify_one();
    }

    /// Non-blocking pop in strict priority order. Marks the job running.
    pub fn try_lease(&self) -> Option<LeasedJob> {
        let queued = {
            let mut lanes = self.lanes.lock().unwrap();
            lanes.iter_mut().find_map(VecDeque::pop_front)
        }?;

        let resume_from = {
            let mut registry = self.registry.lock().unwrap();
            let record = registry.get_mut(&queued.job.id);
            if let Some(record) = record {
                record.status = JobStatus::Running;
                record.checkpoint.clone()
            } else {
                None
            }
        };
        self.persist_status_spawned(queued.job.id, JobStatus::Running, None, None);

        Some(LeasedJob {
            job: queued.job,
            cancel: queued.cancel,
            deadline: queued.deadline,
            resume_from,
        })
    }

    /// Blocks until a job is available or `shutdown` fires.
    pub async fn next_job(&self, shutdown: &CancellationToken) -> Option<LeasedJob> {
        loop {
            if let Some(lease) = self.try_lease() {
                return Some(lease);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    pub async fn complete(&self, id: Uuid, result: Value) {
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(record) = registry.get_mut(&id) {
                record.status = JobStatus::Succeeded;
                record.result = Some(result.clone());
            }
        }
        self.tokens.lock().unwrap().remove(&id);
        self.persist_status_spawned(id, JobStatus::Succeeded, None, Some(result));
    }

    pub async fn fail_terminal(&self, id: Uuid, error: String) {
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(record) = registry.get_mut(&id) {
                record.status = JobStatus::Failed;
                record.error = Some(error.clone());
            }
        }
        self.tokens.lock().unwrap().remove(&id);
        self.persist_status_spawned(id, JobStatus::Failed, Some(error), None);
    }

    pub async fn mark_cancelled(&self, id: Uuid) {
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(record) = registry.get_mut(&id) {
                record.status = JobStatus::Cancelled;
            }
        }
        self.tokens.lock().unwrap().remove(&id);
        self.persist_status_spawned(id, JobStatus::Cancelled, None, None);
    }

    /// Cancels a job by id, whether still queued or already running.
    pub fn cancel_job(&self, id: Uuid) {
        if let Some(token) = self.tokens.lock().unwrap().get(&id) {
            token.cancel();
        }
    }

    /// Re-enqueues a failed job after `delay`, bumping attempts. Used by
    /// workers for transient failures.
    pub fn requeue_after(self: Arc<Self>, mut job: Job, delay: Duration) {
        job.attempts += 1;
        let queue = self;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Retrying job {} (attempt {})", job.id, job.attempts + 1);
            queue.enqueue(job, None);
        });
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub async fn set_checkpoint(&self, id: Uuid, step: &str) {
        {
            let mut registry = self.registry.lock().unwrap();
            if let Some(record) = registry.get_mut(&id) {
                record.checkpoint = Some(step.to_string());
            }
        }
        if let Some(pool) = self.persist.clone() {
            let step = step.to_string();
            if let Err(e) = sqlx::query("UPDATE queue_jobs SET checkpoint = $1 WHERE id = $2")
                .bind(&step)
                .bind(id)
                .execute(&pool)
                .await
            {
                warn!("Failed to persist checkpoint for {id}: {e}");
            }
        }
    }

    pub fn record(&self, id: Uuid) -> Option<JobRecord> {
        self.registry.lock().unwrap().get(&id).cloned()
    }

    /// Maintenance pass, called by the supervisor every sample period:
    /// cancels queued jobs past their deadline and ages waiting jobs one
    /// level per `aging_step` beyond their tier SLA.
    pub async fn maintain(&self) {
        let now = Instant::now();
        let mut expired: Vec<Uuid> = Vec::new();

        {
            let mut lanes = self.lanes.lock().unwrap();
            // Deadline sweep first so expired jobs never get promoted.
            for lane in lanes.iter_mut() {
                lane.retain(|q| {
                    let alive = q.deadline.map(|d| d > now).unwrap_or(true)
                        && !q.cancel.is_cancelled();
                    if !alive {
                        expired.push(q.job.id);
                    }
                    alive
                });
            }

            // Aging: move promoted jobs up, preserving in-lane order.
            for lane_idx in 1..Priority::COUNT {
                let mut keep = VecDeque::new();
                while let Some(q) = lanes[lane_idx].pop_front() {
                    let base = Priority::from_lane(q.lane);
                    let waited = now.duration_since(q.enqueued);
                    let over = waited.saturating_sub(base.sla());
                    let levels =
                        (over.as_secs() / self.config.aging_step.as_secs().max(1)) as usize;
                    let target = q.lane.saturating_sub(levels.min(q.lane));
                    if target < lane_idx {
                        let mut q = q;
                        q.lane = target;
                        lanes[target].push_back(q);
                    } else {
                        keep.push_back(q);
                    }
                }
                lanes[lane_idx] = keep;
            }
        }

        for id in expired {
            self.mark_cancelled(id).await;
        }
    }

    /// Re-enqueues persisted non-terminal jobs with `attempts + 1`.
    /// Called once at startup, before workers spin up.
    pub async fn restore_persisted(&self) -> Result<usize, AppError> {
        let Some(pool) = self.persist.clone() else {
            return Ok(0);
        };

        let rows: Vec<PersistedJobRow> = sqlx::query_as(
            "SELECT id, kind, priority, payload, idem_key, attempts, created_at, deadline_ms, checkpoint
             FROM queue_jobs WHERE status IN ('queued', 'running')",
        )
        .fetch_all(&pool)
        .await?;

        let restored = rows.len();
        for row in rows {
            let job = Job {
                id: row.id,
                kind: parse_kind(&row.kind)?,
                priority: parse_priority(&row.priority)?,
                payload: row.payload,
                idem_key: row.idem_key.clone(),
                attempts: row.attempts as u32 + 1,
                created_at: row.created_at,
                deadline_ms: row.deadline_ms.map(|ms| ms as u64),
            };
            self.idem
                .lock()
                .unwrap()
                .insert(row.idem_key, (job.id, Instant::now()));
            self.enqueue(job, row.checkpoint);
        }
        if restored > 0 {
            info!("Restored {restored} non-terminal jobs from durable storage");
        }
        Ok(restored)
    }

    fn persist_status_spawned(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<Value>,
    ) {
        let Some(pool) = self.persist.clone() else {
            return;
        };
        tokio::spawn(async move {
            let query = sqlx::query(
                "UPDATE queue_jobs
                 SET status = $1, error = $2, result = $3, updated_at = now()
                 WHERE id = $4",
            )
            .bind(status.as_str())
            .bind(error)
            .bind(result)
            .bind(id);
            if let Err(e) = query.execute(&pool).await {
                warn!("Failed to persist status for {id}: {e}");
            }
        });
    }
}

#[derive(sqlx::FromRow)]
struct PersistedJobRow {
    id: Uuid,
    kind: String,
    priority: String,
    payload: Value,
    idem_key: String,
    attempts: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    deadline_ms: Option<i64>,
    checkpoint: Option<String>,
}

async fn persist_insert(pool: &PgPool, job: &Job) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO queue_jobs
            (id, kind, priority, payload, idem_key, attempts, status, created_at, deadline_ms)
         VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(job.id)
    .bind(job.kind.as_str())
    .bind(priority_str(job.priority))
    .bind(&job.payload)
    .bind(&job.idem_key)
    .bind(job.attempts as i32)
    .bind(job.created_at)
    .bind(job.deadline_ms.map(|ms| ms as i64))
    .execute(pool)
    .await?;
    Ok(())
}

fn priority_str(p: Priority) -> &'static str {
    match p {
        Priority::Urgent => "urgent",
        Priority::High => "high",
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

fn parse_priority(s: &str) -> Result<Priority, AppError> {
    match s {
        "urgent" => Ok(Priority::Urgent),
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        other => Err(AppError::Invariant(format!("unknown priority {other}"))),
    }
}

fn parse_kind(s: &str) -> Result<JobKind, AppError> {
    match s {
        "ingest_cv" => Ok(JobKind::IngestCv),
        "ingest_jd" => Ok(JobKind::IngestJd),
        "bulk_match" => Ok(JobKind::BulkMatch),
        "email_application" => Ok(JobKind::EmailApplication),
        other => Err(AppError::Invariant(format!("unknown job kind {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(QueueConfig::default(), None))
    }

    fn small_queue(qmax: usize) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            QueueConfig {
                qmax,
                ..Default::default()
            },
            None,
        ))
    }

    #[tokio::test]
    async fn test_submit_and_lease_in_priority_order() {
        let q = queue();
        q.submit(JobKind::IngestCv, Priority::Low, json!({}), "a".into(), None)
            .await
            .unwrap();
        q.submit(JobKind::IngestCv, Priority::Urgent, json!({}), "b".into(), None)
            .await
            .unwrap();
        q.submit(JobKind::IngestCv, Priority::Normal, json!({}), "c".into(), None)
            .await
            .unwrap();

        let order: Vec<String> = [
            q.try_lease().unwrap(),
            q.try_lease().unwrap(),
            q.try_lease().unwrap(),
        ]
        .iter()
        .map(|l| l.job.idem_key.clone())
        .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert!(q.try_lease().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_at_qmax() {
        let q = small_queue(2);
        q.submit(JobKind::IngestCv, Priority::Normal, json!({}), "a".into(), None)
            .await
            .unwrap();
        q.submit(JobKind::IngestCv, Priority::Normal, json!({}), "b".into(), None)
            .await
            .unwrap();
        let err = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "c".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BackPressure { depth: 2 }));
    }

    #[tokio::test]
    async fn test_memory_gate_rejects() {
        let q = queue();
        q.set_mem_gate(true);
        let err = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "a".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BackPressure { .. }));
        q.set_mem_gate(false);
        assert!(q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "a".into(), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_idempotency_collision_returns_prior_id() {
        let q = queue();
        let first = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "same".into(), None)
            .await
            .unwrap();
        let err = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "same".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::IdempotencyCollision { prior_job_id } if prior_job_id == first
        ));
    }

    #[tokio::test]
    async fn test_idempotency_survives_completion() {
        // At-most-once within the window: even a finished job blocks its key.
        let q = queue();
        let id = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap();
        let lease = q.try_lease().unwrap();
        q.complete(lease.job.id, json!({"ok": true})).await;
        let err = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "k".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::IdempotencyCollision { prior_job_id } if prior_job_id == id
        ));
    }

    #[tokio::test]
    async fn test_record_tracks_lifecycle() {
        let q = queue();
        let id = q
            .submit(JobKind::BulkMatch, Priority::High, json!({}), "x".into(), None)
            .await
            .unwrap();
        assert_eq!(q.record(id).unwrap().status, JobStatus::Queued);

        let lease = q.try_lease().unwrap();
        assert_eq!(q.record(id).unwrap().status, JobStatus::Running);

        q.complete(lease.job.id, json!({"n": 1})).await;
        let record = q.record(id).unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_checkpoint_visible_on_requeue() {
        let q = queue();
        let id = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "x".into(), None)
            .await
            .unwrap();
        let lease = q.try_lease().unwrap();
        q.set_checkpoint(id, "extract").await;
        q.clone().requeue_after(lease.job, Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let lease = q.try_lease().unwrap();
        assert_eq!(lease.resume_from.as_deref(), Some("extract"));
        assert_eq!(lease.job.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_sweep_cancels_queued_jobs() {
        let q = queue();
        let id = q
            .submit(
                JobKind::IngestCv,
                Priority::Normal,
                json!({}),
                "x".into(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        q.maintain().await;
        assert_eq!(q.record(id).unwrap().status, JobStatus::Cancelled);
        assert!(q.try_lease().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_promotes_waiting_jobs() {
        let q = queue();
        q.submit(JobKind::IngestCv, Priority::Low, json!({}), "slow".into(), None)
            .await
            .unwrap();
        // Low SLA is 900 s; waiting 900 s + 2 aging steps promotes twice.
        tokio::time::advance(Duration::from_secs(900 + 121)).await;
        q.maintain().await;

        let lanes = q.lanes.lock().unwrap();
        assert_eq!(lanes[Priority::Low.lane()].len(), 0);
        assert_eq!(lanes[Priority::High.lane()].len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_job_cancels_token() {
        let q = queue();
        let id = q
            .submit(JobKind::IngestCv, Priority::Normal, json!({}), "x".into(), None)
            .await
            .unwrap();
        let lease = q.try_lease().unwrap();
        q.cancel_job(id);
        assert!(lease.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_next_job_returns_none_on_shutdown() {
        let q = queue();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(q.next_job(&shutdown).await.is_none());
    }
}

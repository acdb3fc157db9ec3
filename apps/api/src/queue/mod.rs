//! Priority job queue with back-pressure, idempotency, retries, and an
//! auto-scaling worker pool.
//!
//! Ordering guarantees: none across workers. Per idempotency key the queue
//! enforces at-most-once completion within a 24 h window. Jobs are owned by
//! the queue; their lifetime ends on a terminal state.

pub mod queue;
pub mod supervisor;
pub mod worker;

pub use queue::{JobQueue, QueueConfig};
pub use supervisor::{ScalingConfig, Supervisor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    IngestCv,
    IngestJd,
    BulkMatch,
    EmailApplication,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::IngestCv => "ingest_cv",
            JobKind::IngestJd => "ingest_jd",
            JobKind::BulkMatch => "bulk_match",
            JobKind::EmailApplication => "email_application",
        }
    }
}

/// Strict priority tiers. Lower index runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn lane(&self) -> usize {
        *self as usize
    }

    /// Wait-time SLA per tier; a job aging past it starts climbing.
    pub fn sla(&self) -> std::time::Duration {
        match self {
            Priority::Urgent => std::time::Duration::from_secs(10),
            Priority::High => std::time::Duration::from_secs(60),
            Priority::Normal => std::time::Duration::from_secs(300),
            Priority::Low => std::time::Duration::from_secs(900),
        }
    }

    pub fn promoted(&self) -> Priority {
        match self {
            Priority::Urgent | Priority::High => Priority::Urgent,
            Priority::Normal => Priority::High,
            Priority::Low => Priority::Normal,
        }
    }

    pub fn from_lane(lane: usize) -> Priority {
        match lane {
            0 => Priority::Urgent,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub priority: Priority,
    pub payload: Value,
    /// `content_hash` for ingests, `message_id` for e-mail applications.
    pub idem_key: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Milliseconds from submission; enforcement uses a monotonic clock.
    pub deadline_ms: Option<u64>,
}

/// Progress snapshot exposed on `GET /job/{id}` and persisted for restarts.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job: Job,
    pub status: JobStatus,
    /// Last completed pipeline step; a restarted job resumes after it.
    pub checkpoint: Option<String>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

/// Handle given to a running handler for checkpointing and cancellation.
pub struct JobContext {
    pub job_id: Uuid,
    pub cancel: CancellationToken,
    queue: std::sync::Arc<JobQueue>,
    /// Checkpoint already reached before this attempt (crash recovery).
    pub resume_from: Option<String>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        cancel: CancellationToken,
        queue: std::sync::Arc<JobQueue>,
        resume_from: Option<String>,
    ) -> Self {
        Self {
            job_id,
            cancel,
            queue,
            resume_from,
        }
    }

    /// Records that `step` completed, so a crash resumes after it.
    pub async fn checkpoint(&self, step: &str) {
        self.queue.set_checkpoint(self.job_id, step).await;
    }

    /// True when `step` already completed in a previous attempt.
    pub fn already_done(&self, step: &str) -> bool {
        match &self.resume_from {
            Some(reached) => step_index(step) <= step_index(reached),
            None => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Pipeline steps in execution order; used to compare checkpoints.
pub const PIPELINE_STEPS: [&str; 5] = ["parse", "mask", "extract", "embed", "store"];

fn step_index(step: &str) -> usize {
    PIPELINE_STEPS
        .iter()
        .position(|s| *s == step)
        .unwrap_or(usize::MAX)
}

/// Executes jobs pulled by workers. One implementation per deployment,
/// dispatching on `job.kind`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_lanes() {
        assert!(Priority::Urgent < Priority::Low);
        assert_eq!(Priority::Urgent.lane(), 0);
        assert_eq!(Priority::Low.lane(), 3);
        assert_eq!(Priority::from_lane(2), Priority::Normal);
    }

    #[test]
    fn test_promotion_tops_out_at_urgent() {
        assert_eq!(Priority::Low.promoted(), Priority::Normal);
        assert_eq!(Priority::Normal.promoted(), Priority::High);
        assert_eq!(Priority::High.promoted(), Priority::Urgent);
        assert_eq!(Priority::Urgent.promoted(), Priority::Urgent);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_step_ordering() {
        assert!(step_index("parse") < step_index("extract"));
        assert!(step_index("embed") < step_index("store"));
        assert_eq!(step_index("unknown"), usize::MAX);
    }
}

//! Mail poller: routes unread CVs to job postings by subject code.
//!
//! A single poller instance runs per deployment, guarded by an exclusive
//! lock file. Message ids it has handled persist in an append-only file so
//! a restart never re-enqueues an application; the queue's idempotency
//! window is the second line of defense.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use regex::Regex;
use sqlx::PgPool;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::ingest::EmailApplicationPayload;
use crate::mail::{MailAttachment, MailMessage, Mailbox};
use crate::models::{JobPosting, SubjectCode};
use crate::object_store::ObjectStore;
use crate::queue::{JobKind, JobQueue, Priority};

/// How far back processed ids are retained through compaction.
const PROCESSED_RETENTION_DAYS: i64 = 90;

fn subject_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+?)\s*\|\s*([A-Z]{2,4}-\d{4}-\d{3})$").expect("static regex")
    })
}

/// Strips `Re:` / `Fwd:` / `Fw:` prefixes (repeatedly) and matches the
/// routing pattern `"<anything> | <subject code>"`.
pub fn parse_subject(raw: &str) -> Option<(String, SubjectCode)> {
    let mut subject = raw.trim();
    loop {
        let lower = subject.to_ascii_lowercase();
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|p| lower.starts_with(**p))
            .map(|p| subject[p.len()..].trim_start());
        match stripped {
            Some(rest) => subject = rest,
            None => break,
        }
    }

    let captures = subject_re().captures(subject)?;
    let code = SubjectCode::parse(captures.get(2)?.as_str()).ok()?;
    Some((captures.get(1)?.as_str().trim().to_string(), code))
}

fn attachment_accepted(attachment: &MailAttachment) -> bool {
    match attachment.mime.as_str() {
        "application/pdf"
        | "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "text/plain" => true,
        // Some clients send generic types; fall back to the extension.
        _ => attachment
            .filename
            .as_deref()
            .map(|name| {
                let lower = name.to_ascii_lowercase();
                [".pdf", ".docx", ".doc", ".txt"]
                    .iter()
                    .any(|ext| lower.ends_with(ext))
            })
            .unwrap_or(false),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Processed-id persistence
// ────────────────────────────────────────────────────────────────────────────

/// Append-only set of handled message ids, one id per line, with `# date`
/// day markers so compaction can drop sections older than the retention
/// window.
pub struct ProcessedSet {
    path: PathBuf,
    inner: Mutex<ProcessedInner>,
}

struct ProcessedInner {
    ids: HashSet<String>,
    entries: Vec<(NaiveDate, String)>,
    current_day: Option<NaiveDate>,
    file: File,
}

impl ProcessedSet {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let mut ids = HashSet::new();
        let mut entries = Vec::new();
        let mut day = Utc::now().date_naive();

        if path.exists() {
            let reader = BufReader::new(
                File::open(path).map_err(|e| AppError::Config(format!("processed set: {e}")))?,
            );
            for line in reader.lines() {
                let line = line.map_err(|e| AppError::Config(format!("processed set: {e}")))?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(marker) = line.strip_prefix('#') {
                    if let Ok(parsed) = NaiveDate::parse_from_str(marker.trim(), "%Y-%m-%d") {
                        day = parsed;
                    }
                    continue;
                }
                ids.insert(line.to_string());
                entries.push((day, line.to_string()));
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AppError::Config(format!("processed set: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(ProcessedInner {
                ids,
                entries,
                current_day: None,
                file,
            }),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an id (with a day marker when the UTC day rolls over).
    pub fn insert(&self, id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.ids.insert(id.to_string()) {
            return Ok(false);
        }
        let today = Utc::now().date_naive();
        if inner.current_day != Some(today) {
            inner.current_day = Some(today);
            writeln!(inner.file, "# {today}")
                .map_err(|e| AppError::Internal(anyhow::anyhow!("processed set write: {e}")))?;
        }
        writeln!(inner.file, "{id}")
            .map_err(|e| AppError::Internal(anyhow::anyhow!("processed set write: {e}")))?;
        inner.entries.push((today, id.to_string()));
        inner
            .file
            .flush()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("processed set flush: {e}")))?;
        Ok(true)
    }

    /// Rewrites the file keeping only entries within the retention window.
    pub fn compact(&self) -> Result<(), AppError> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(PROCESSED_RETENTION_DAYS);
        let mut inner = self.inner.lock().unwrap();

        inner.entries.retain(|(day, _)| *day >= cutoff);
        let retained: Vec<(NaiveDate, String)> = inner.entries.clone();
        inner.ids = retained.iter().map(|(_, id)| id.clone()).collect();

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("compact: {e}")))?;
            let mut last_day: Option<NaiveDate> = None;
            for (day, id) in &retained {
                if last_day != Some(*day) {
                    writeln!(tmp, "# {day}")
                        .map_err(|e| AppError::Internal(anyhow::anyhow!("compact: {e}")))?;
                    last_day = Some(*day);
                }
                writeln!(tmp, "{id}")
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("compact: {e}")))?;
            }
        }
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("compact rename: {e}")))?;

        inner.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("compact reopen: {e}")))?;
        inner.current_day = None;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Leader lock
// ────────────────────────────────────────────────────────────────────────────

/// Exclusive file lock so exactly one poller runs across workers. A lock
/// left by a dead process (stale pid) is reclaimed.
pub struct LeaderLock {
    path: PathBuf,
}

impl LeaderLock {
    pub fn acquire(path: &Path) -> Option<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Some(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(_) => {
                if Self::holder_is_dead(path) {
                    warn!("Reclaiming stale poller lock at {}", path.display());
                    let _ = std::fs::remove_file(path);
                    return Self::acquire_once(path);
                }
                None
            }
        }
    }

    fn acquire_once(path: &Path) -> Option<Self> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .ok()
            .map(|mut file| {
                let _ = writeln!(file, "{}", std::process::id());
                Self {
                    path: path.to_path_buf(),
                }
            })
    }

    fn holder_is_dead(path: &Path) -> bool {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return false;
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return true;
        };
        !Path::new(&format!("/proc/{pid}")).exists()
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Poller
// ────────────────────────────────────────────────────────────────────────────

/// Posting lookup, narrowed for testability.
#[async_trait]
pub trait PostingDirectory: Send + Sync {
    async fn find_by_subject_code(
        &self,
        code: &SubjectCode,
    ) -> Result<Option<JobPosting>, AppError>;
}

pub struct PgPostingDirectory {
    pool: PgPool,
}

impl PgPostingDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PostingDirectory for PgPostingDirectory {
    async fn find_by_subject_code(
        &self,
        code: &SubjectCode,
    ) -> Result<Option<JobPosting>, AppError> {
        crate::db::get_posting_by_subject_code(&self.pool, code).await
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct PollStats {
    pub enqueued: usize,
    pub duplicates: usize,
    pub invalid_subject: usize,
    pub deferred: usize,
}

pub struct MailPoller {
    mailbox: Arc<dyn Mailbox>,
    directory: Arc<dyn PostingDirectory>,
    queue: Arc<JobQueue>,
    blobs: Arc<dyn ObjectStore>,
    processed: ProcessedSet,
    interval: Duration,
    lock_path: PathBuf,
}

impl MailPoller {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        directory: Arc<dyn PostingDirectory>,
        queue: Arc<JobQueue>,
        blobs: Arc<dyn ObjectStore>,
        processed: ProcessedSet,
        interval: Duration,
        lock_path: PathBuf,
    ) -> Self {
        Self {
            mailbox,
            directory,
            queue,
            blobs,
            processed,
            interval,
            lock_path,
        }
    }

    /// Polls until shutdown. Exits quietly when another instance already
    /// holds the leader lock.
    pub async fn run(self, shutdown: CancellationToken) {
        let Some(_lock) = LeaderLock::acquire(&self.lock_path) else {
            info!("Another poller instance holds the lock, standing down");
            return;
        };
        info!("Mail poller started, interval {:?}", self.interval);

        loop {
            match self.poll_once().await {
                Ok(stats) if stats != PollStats::default() => {
                    info!(
                        "Mail poll: {} enqueued, {} duplicate, {} invalid, {} deferred",
                        stats.enqueued, stats.duplicates, stats.invalid_subject, stats.deferred
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Mail poll failed: {e}"),
            }
            if let Err(e) = self.processed.compact() {
                warn!("Processed-set compaction failed: {e}");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Mail poller stopped");
    }

    pub async fn poll_once(&self) -> Result<PollStats, AppError> {
        let mut stats = PollStats::default();

        for message in self.mailbox.list_unread().await? {
            if self.processed.contains(&message.message_id) {
                stats.duplicates += 1;
                continue;
            }

            match self.route_message(&message).await? {
                Routing::Enqueued => {
                    stats.enqueued += 1;
                    self.finish(&message).await?;
                }
                Routing::AlreadyQueued => {
                    stats.duplicates += 1;
                    self.finish(&message).await?;
                }
                Routing::InvalidSubject(reason) => {
                    info!(
                        "Message {} marked invalid_subject: {reason}",
                        message.message_id
                    );
                    stats.invalid_subject += 1;
                    self.finish(&message).await?;
                }
                Routing::Deferred => {
                    // Back-pressure: leave unprocessed so the next poll
                    // retries the same message.
                    stats.deferred += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn finish(&self, message: &MailMessage) -> Result<(), AppError> {
        self.processed.insert(&message.message_id)?;
        self.mailbox.mark_processed(message).await
    }

    async fn route_message(&self, message: &MailMessage) -> Result<Routing, AppError> {
        let Some((_, code)) = parse_subject(&message.subject) else {
            return Ok(Routing::InvalidSubject(format!(
                "subject does not route: {:?}",
                message.subject
            )));
        };

        let posting = self.directory.find_by_subject_code(&code).await?;
        let posting = match posting {
            Some(p) if p.active => p,
            Some(_) => {
                return Ok(Routing::InvalidSubject(format!(
                    "posting {code} is inactive"
                )))
            }
            None => return Ok(Routing::InvalidSubject(format!("unknown code {code}"))),
        };

        let Some(attachment) = message.attachments.iter().find(|a| attachment_accepted(a))
        else {
            return Ok(Routing::InvalidSubject("no usable attachment".to_string()));
        };

        let blob_key = format!("mail/{}", Uuid::new_v4());
        self.blobs
            .put(&blob_key, bytes::Bytes::from(attachment.data.clone()))
            .await?;

        let payload = EmailApplicationPayload {
            posting_id: posting.posting_id,
            blob_key,
            declared_mime: attachment.mime.clone(),
            applicant_name: message.from_name.clone(),
            applicant_email: message.from_email.clone(),
            message_id: message.message_id.clone(),
        };

        match self
            .queue
            .submit(
                JobKind::EmailApplication,
                Priority::High,
                serde_json::to_value(&payload).map_err(|e| AppError::Internal(e.into()))?,
                message.message_id.clone(),
                None,
            )
            .await
        {
            Ok(_) => Ok(Routing::Enqueued),
            Err(AppError::IdempotencyCollision { .. }) => Ok(Routing::AlreadyQueued),
            Err(AppError::BackPressure { .. }) => Ok(Routing::Deferred),
            Err(e) => Err(e),
        }
    }
}

enum Routing {
    Enqueued,
    AlreadyQueued,
    InvalidSubject(String),
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;
    use crate::queue::QueueConfig;
    use std::collections::HashMap;

    #[test]
    fn test_parse_subject_accepts_routing_format() {
        let (name, code) = parse_subject("Data Analyst | DA-2025-004").unwrap();
        assert_eq!(name, "Data Analyst");
        assert_eq!(code.as_str(), "DA-2025-004");
    }

    #[test]
    fn test_parse_subject_strips_reply_prefixes() {
        let (_, code) = parse_subject("Re: Fwd: Data Analyst | DA-2025-004").unwrap();
        assert_eq!(code.as_str(), "DA-2025-004");
        assert!(parse_subject("RE: re: Backend Dev | BE-2024-001").is_some());
    }

    #[test]
    fn test_parse_subject_rejects_bad_formats() {
        assert!(parse_subject("Data Analyst DA-2025-004").is_none());
        assert!(parse_subject("| DA-2025-004").is_none());
        assert!(parse_subject("Data Analyst | da-2025-004").is_none());
        assert!(parse_subject("Data Analyst | DA-2025-004 extra").is_none());
    }

    #[test]
    fn test_attachment_mime_filter() {
        let pdf = MailAttachment {
            filename: None,
            mime: "application/pdf".into(),
            data: vec![],
        };
        assert!(attachment_accepted(&pdf));
        let by_ext = MailAttachment {
            filename: Some("cv.DOCX".into()),
            mime: "application/octet-stream".into(),
            data: vec![],
        };
        assert!(attachment_accepted(&by_ext));
        let image = MailAttachment {
            filename: Some("photo.heic".into()),
            mime: "image/heic".into(),
            data: vec![],
        };
        assert!(!attachment_accepted(&image));
    }

    #[test]
    fn test_processed_set_roundtrip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.log");
        {
            let set = ProcessedSet::open(&path).unwrap();
            assert!(set.insert("<m1@x>").unwrap());
            assert!(!set.insert("<m1@x>").unwrap());
            assert!(set.insert("<m2@x>").unwrap());
            assert_eq!(set.len(), 2);
        }
        let reloaded = ProcessedSet::open(&path).unwrap();
        assert!(reloaded.contains("<m1@x>"));
        assert!(reloaded.contains("<m2@x>"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_processed_set_compaction_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.log");
        // Seed a file with one ancient section and one recent insert.
        std::fs::write(&path, "# 2020-01-01\n<old@x>\n").unwrap();
        let set = ProcessedSet::open(&path).unwrap();
        set.insert("<new@x>").unwrap();
        set.compact().unwrap();
        assert!(!set.contains("<old@x>"));
        assert!(set.contains("<new@x>"));

        let reloaded = ProcessedSet::open(&path).unwrap();
        assert!(!reloaded.contains("<old@x>"));
        assert!(reloaded.contains("<new@x>"));
    }

    #[test]
    fn test_leader_lock_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.lock");
        let first = LeaderLock::acquire(&path).unwrap();
        // Same (live) process holds it: second acquire must fail.
        assert!(LeaderLock::acquire(&path).is_none());
        drop(first);
        assert!(LeaderLock::acquire(&path).is_some());
    }

    #[test]
    fn test_leader_lock_reclaims_stale_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.lock");
        // A pid that cannot exist on Linux.
        std::fs::write(&path, "4194304999\n").unwrap();
        assert!(LeaderLock::acquire(&path).is_some());
    }

    // ── Poller end-to-end with fakes ───────────────────────────────────

    struct FakeMailbox {
        messages: Vec<MailMessage>,
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn list_unread(&self) -> Result<Vec<MailMessage>, AppError> {
            Ok(self.messages.clone())
        }

        async fn mark_processed(&self, _message: &MailMessage) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct FakeDirectory {
        postings: HashMap<String, JobPosting>,
    }

    #[async_trait]
    impl PostingDirectory for FakeDirectory {
        async fn find_by_subject_code(
            &self,
            code: &SubjectCode,
        ) -> Result<Option<JobPosting>, AppError> {
            Ok(self.postings.get(code.as_str()).cloned())
        }
    }

    fn posting(code: &str, active: bool) -> JobPosting {
        JobPosting {
            posting_id: Uuid::new_v4(),
            jd_id: Uuid::new_v4(),
            public_token: "tok".into(),
            subject_code: SubjectCode::parse(code).unwrap(),
            active,
            created_at: Utc::now(),
            created_by: Uuid::new_v4(),
            applications: vec![],
        }
    }

    fn cv_message(id: &str, subject: &str) -> MailMessage {
        MailMessage::new(
            id.to_string(),
            subject.to_string(),
            Some("Jane Doe".into()),
            Some("jane@example.com".into()),
            vec![MailAttachment {
                filename: Some("cv.pdf".into()),
                mime: "application/pdf".into(),
                data: b"%PDF-1.4".to_vec(),
            }],
        )
    }

    fn poller_with(messages: Vec<MailMessage>, postings: Vec<JobPosting>) -> (MailPoller, Arc<JobQueue>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), None));
        let processed = ProcessedSet::open(&dir.path().join("processed.log")).unwrap();
        let directory = FakeDirectory {
            postings: postings
                .into_iter()
                .map(|p| (p.subject_code.as_str().to_string(), p))
                .collect(),
        };
        let poller = MailPoller::new(
            Arc::new(FakeMailbox { messages }),
            Arc::new(directory),
            queue.clone(),
            Arc::new(MemoryObjectStore::default()),
            processed,
            Duration::from_secs(300),
            dir.path().join("poller.lock"),
        );
        (poller, queue, dir)
    }

    #[tokio::test]
    async fn test_valid_message_enqueues_application() {
        let (poller, queue, _dir) = poller_with(
            vec![cv_message("<m1@x>", "Data Analyst | DA-2025-004")],
            vec![posting("DA-2025-004", true)],
        );
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(queue.depth(), 1);
        let lease = queue.try_lease().unwrap();
        assert_eq!(lease.job.kind, JobKind::EmailApplication);
        assert_eq!(lease.job.idem_key, "<m1@x>");
    }

    #[tokio::test]
    async fn test_second_poll_is_idempotent() {
        let (poller, queue, _dir) = poller_with(
            vec![cv_message("<m1@x>", "Data Analyst | DA-2025-004")],
            vec![posting("DA-2025-004", true)],
        );
        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.enqueued, 1);
        let size_after_first = poller.processed.len();

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(poller.processed.len(), size_after_first);
        assert_eq!(queue.depth(), 1, "no new job on the second poll");
    }

    #[tokio::test]
    async fn test_unknown_code_is_invalid_subject() {
        let (poller, queue, _dir) = poller_with(
            vec![cv_message("<m1@x>", "Data Analyst | ZZ-9999-999")],
            vec![posting("DA-2025-004", true)],
        );
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.invalid_subject, 1);
        assert_eq!(queue.depth(), 0);
        // Invalid messages still land in the processed set.
        assert!(poller.processed.contains("<m1@x>"));
    }

    #[tokio::test]
    async fn test_inactive_posting_is_invalid_subject() {
        let (poller, queue, _dir) = poller_with(
            vec![cv_message("<m1@x>", "Data Analyst | DA-2025-004")],
            vec![posting("DA-2025-004", false)],
        );
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.invalid_subject, 1);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_unroutable_subject_is_invalid() {
        let (poller, _queue, _dir) = poller_with(
            vec![cv_message("<m1@x>", "Hello there")],
            vec![posting("DA-2025-004", true)],
        );
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.invalid_subject, 1);
    }

    #[tokio::test]
    async fn test_backpressure_defers_without_processing() {
        let (poller, queue, _dir) = poller_with(
            vec![cv_message("<m1@x>", "Data Analyst | DA-2025-004")],
            vec![posting("DA-2025-004", true)],
        );
        queue.set_mem_gate(true);
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.deferred, 1);
        // Not in the processed set: the next poll must retry it.
        assert!(!poller.processed.contains("<m1@x>"));

        queue.set_mem_gate(false);
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.enqueued, 1);
    }
}

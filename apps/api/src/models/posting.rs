//! Job postings and the applications that arrive against them.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::errors::AppError;

fn subject_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{2,4}-\d{4}-\d{3}$").expect("static regex"))
}

/// A validated posting subject code, e.g. `DA-2025-004`.
/// ASCII only; the mail ingestor routes CVs with this code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectCode(String);

impl SubjectCode {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if subject_code_re().is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(AppError::InvalidSubject(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Weak reference from a posting to a CV that applied. The posting does not
/// own the CV; deleting either side leaves the other intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub cv_id: Uuid,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub match_score: Option<f32>,
}

/// Link between a JD and a public token plus subject code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    pub posting_id: Uuid,
    pub jd_id: Uuid,
    pub public_token: String,
    pub subject_code: SubjectCode,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: Uuid,
    #[serde(default)]
    pub applications: Vec<ApplicationRef>,
}

/// Created on e-mail ingest. References a CV and a posting without owning
/// either; deletion of either marks the application orphaned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub application_id: Uuid,
    pub posting_id: Uuid,
    pub cv_id: Uuid,
    pub applicant_name: Option<String>,
    pub applicant_email: Option<String>,
    pub applicant_phone: Option<String>,
    /// Mailbox message id; doubles as the idempotency key.
    pub email_id: String,
    pub submitted_at: DateTime<Utc>,
    pub requires_manual_matching: bool,
    pub orphaned: bool,
}

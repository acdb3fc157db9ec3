//! Document and Structured records, the canonical units of ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{MAX_PHRASE_BYTES, PAD_SENTINEL, RESP_SLOTS, SKILL_SLOTS};

/// Whether a document is a candidate CV or a job description.
/// Downstream code dispatches on this tag; the two kinds share one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Cv,
    Jd,
}

impl DocumentKind {
    /// Prefix shared by the three mirror collections of this kind.
    pub fn collection_prefix(&self) -> &'static str {
        match self {
            DocumentKind::Cv => "cv",
            DocumentKind::Jd => "jd",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.collection_prefix())
    }
}

/// How a document entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Direct,
    EmailApplication,
    BulkImport,
}

/// A CV or JD as stored in the documents collection.
///
/// `raw_text` is the PII-masked cleaned text; originals of masked tokens live
/// in a separate side map keyed by `id` and never reach the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub kind: DocumentKind,
    /// URI of the original blob in the object store. The core reads it once.
    pub blob_ref: String,
    /// Lowercase hex SHA-256 over the cleaned text. Extractor cache key part.
    pub content_hash: String,
    pub raw_text: String,
    pub upload_time: DateTime<Utc>,
    pub source: Source,
}

/// Masked PII tokens carried on the structured record. Opaque placeholders;
/// the originals are only available through the side map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskedPii {
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Deterministic LLM output per document: exactly 20 skills and 10
/// responsibilities after normalization, padded with [`PAD_SENTINEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structured {
    pub job_title: String,
    pub category: String,
    pub skills: Vec<String>,
    pub responsibilities: Vec<String>,
    /// Non-negative. When the source text gives a range, the lower bound.
    pub years_experience: f32,
    #[serde(default)]
    pub masked_pii: MaskedPii,
}

impl Structured {
    /// Checks the post-normalization invariants. A violation here is a bug in
    /// the extractor, not bad input, so it maps to the fatal error class.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.skills.len() != SKILL_SLOTS {
            return Err(AppError::Invariant(format!(
                "skills cardinality {} != {SKILL_SLOTS}",
                self.skills.len()
            )));
        }
        if self.responsibilities.len() != RESP_SLOTS {
            return Err(AppError::Invariant(format!(
                "responsibilities cardinality {} != {RESP_SLOTS}",
                self.responsibilities.len()
            )));
        }
        if self.years_experience < 0.0 || !self.years_experience.is_finite() {
            return Err(AppError::Invariant(format!(
                "years_experience {} is negative or non-finite",
                self.years_experience
            )));
        }
        for phrase in self.skills.iter().chain(self.responsibilities.iter()) {
            if phrase.is_empty() {
                return Err(AppError::Invariant("empty phrase slot".to_string()));
            }
            if phrase.len() > MAX_PHRASE_BYTES {
                return Err(AppError::Invariant(format!(
                    "phrase exceeds {MAX_PHRASE_BYTES} bytes: {:.40}…",
                    phrase
                )));
            }
        }
        Ok(())
    }

    /// Number of non-pad skill slots.
    pub fn present_skills(&self) -> usize {
        self.skills.iter().filter(|s| *s != PAD_SENTINEL).count()
    }

    /// Number of non-pad responsibility slots.
    pub fn present_responsibilities(&self) -> usize {
        self.responsibilities
            .iter()
            .filter(|s| *s != PAD_SENTINEL)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn padded_structured() -> Structured {
        let mut skills: Vec<String> = vec!["rust".into(), "sql".into()];
        skills.resize(SKILL_SLOTS, PAD_SENTINEL.to_string());
        let mut responsibilities: Vec<String> = vec!["Designs data pipelines.".into()];
        responsibilities.resize(RESP_SLOTS, PAD_SENTINEL.to_string());
        Structured {
            job_title: "Data Engineer".into(),
            category: "Software Engineering".into(),
            skills,
            responsibilities,
            years_experience: 4.0,
            masked_pii: MaskedPii::default(),
        }
    }

    #[test]
    fn test_valid_structured_passes() {
        assert!(padded_structured().validate().is_ok());
    }

    #[test]
    fn test_wrong_skill_cardinality_fails() {
        let mut s = padded_structured();
        s.skills.pop();
        assert!(matches!(s.validate(), Err(AppError::Invariant(_))));
    }

    #[test]
    fn test_wrong_resp_cardinality_fails() {
        let mut s = padded_structured();
        s.responsibilities.push(PAD_SENTINEL.into());
        assert!(matches!(s.validate(), Err(AppError::Invariant(_))));
    }

    #[test]
    fn test_negative_experience_fails() {
        let mut s = padded_structured();
        s.years_experience = -1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_oversized_phrase_fails() {
        let mut s = padded_structured();
        s.skills[0] = "x".repeat(MAX_PHRASE_BYTES + 1);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_present_counts_exclude_pads() {
        let s = padded_structured();
        assert_eq!(s.present_skills(), 2);
        assert_eq!(s.present_responsibilities(), 1);
    }

    #[test]
    fn test_kind_collection_prefix() {
        assert_eq!(DocumentKind::Cv.collection_prefix(), "cv");
        assert_eq!(DocumentKind::Jd.collection_prefix(), "jd");
    }

    #[test]
    fn test_source_serde_snake_case() {
        let s: Source = serde_json::from_str("\"email_application\"").unwrap();
        assert_eq!(s, Source::EmailApplication);
    }
}

//! Extractor: deterministic LLM-backed `Structured` records.
//!
//! Always yields exactly 20 skills and 10 responsibilities per document. The
//! downstream matcher relies on those fixed cardinalities to preallocate its
//! cost matrices, so normalization here is the invariant boundary: whatever
//! the model returns, the record that leaves this module is 20/10 or the
//! call fails.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{ext_key, TieredCache, EXT_TTL};
use crate::errors::AppError;
use crate::llm_client::prompts::{extract_schema, EXTRACT_PROMPT_TEMPLATE, EXTRACT_SYSTEM, PROMPT_VERSION};
use crate::llm_client::{CompletionParams, Llm, LlmError};
use crate::models::{DocumentKind, MaskedPii, Structured, PAD_SENTINEL, RESP_SLOTS, SKILL_SLOTS};

/// Texts longer than this are chunked before extraction.
pub const CHUNK_THRESHOLD_CHARS: usize = 100_000;
/// Window size for chunked extraction.
pub const CHUNK_WINDOW_CHARS: usize = 80_000;
/// Overlap between consecutive windows so no phrase is split.
pub const CHUNK_OVERLAP_CHARS: usize = 2_000;

const SCHEMA_RETRIES: u32 = 3;

/// Lowercase hex SHA-256 over text. Used for `content_hash` and phrase keys.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Raw reply shape; normalization turns this into a valid `Structured`.
#[derive(Debug, Deserialize)]
struct RawExtraction {
    job_title: String,
    category: String,
    skills: Vec<String>,
    responsibilities: Vec<String>,
    years_experience: f32,
}

pub struct Extractor {
    llm: Arc<dyn Llm>,
    cache: Arc<TieredCache>,
}

impl Extractor {
    pub fn new(llm: Arc<dyn Llm>, cache: Arc<TieredCache>) -> Self {
        Self { llm, cache }
    }

    /// Cache key for a given cleaned text and kind:
    /// `H(text, kind, prompt_version, model_id)`. Exposed so deletion can
    /// invalidate the cached extraction alongside the stored records.
    pub fn cache_key(&self, text: &str, kind: DocumentKind) -> String {
        let cache_hash = content_hash(&format!("{kind}:{text}"));
        ext_key(PROMPT_VERSION, self.llm.model_id(), &cache_hash)
    }

    /// Drops the cached extraction for `text`, if any. Called when the
    /// owning document is deleted.
    pub async fn invalidate(&self, text: &str, kind: DocumentKind) {
        self.cache.del(&self.cache_key(text, kind)).await;
    }

    /// `Extract(text, kind) → Structured`, cached by
    /// `H(text, kind, prompt_version, model_id)`.
    pub async fn extract(&self, text: &str, kind: DocumentKind) -> Result<Structured, AppError> {
        let key = self.cache_key(text, kind);

        if let Some(cached) = self.cache.get_json::<Structured>(&key).await {
            debug!("Extraction cache hit for {key}");
            return Ok(cached);
        }

        let structured = if text.chars().count() > CHUNK_THRESHOLD_CHARS {
            self.extract_chunked(text, kind).await?
        } else {
            let raw = self.call_window(text, kind).await?;
            normalize(raw)?
        };

        structured.validate()?;
        self.cache.set_json(&key, &structured, EXT_TTL).await;
        Ok(structured)
    }

    /// Runs each window, merges by union, re-ranks by frequency × recency
    /// weight, and truncates back to the fixed cardinalities.
    async fn extract_chunked(
        &self,
        text: &str,
        kind: DocumentKind,
    ) -> Result<Structured, AppError> {
        let windows = chunk_windows(text, CHUNK_WINDOW_CHARS, CHUNK_OVERLAP_CHARS);
        debug!("Chunked extraction across {} windows", windows.len());

        let mut raws = Vec::with_capacity(windows.len());
        for window in &windows {
            raws.push(self.call_window(window, kind).await?);
        }

        let skills = merge_ranked(
            raws.iter().map(|r| r.skills.as_slice()),
            SKILL_SLOTS,
        );
        let responsibilities = merge_ranked(
            raws.iter().map(|r| r.responsibilities.as_slice()),
            RESP_SLOTS,
        );

        // Title and category come from the first window (document header);
        // experience takes the maximum seen since windows each observe a
        // partial history.
        let first = raws.first().expect("at least one window");
        let merged = RawExtraction {
            job_title: first.job_title.clone(),
            category: first.category.clone(),
            skills,
            responsibilities,
            years_experience: raws
                .iter()
                .map(|r| r.years_experience)
                .fold(0.0_f32, f32::max),
        };
        normalize(merged)
    }

    /// One window: LLM call with strict schema, retried on schema failures.
    async fn call_window(&self, text: &str, kind: DocumentKind) -> Result<RawExtraction, AppError> {
        let kind_name = match kind {
            DocumentKind::Cv => "candidate CV",
            DocumentKind::Jd => "job description",
        };
        let prompt = EXTRACT_PROMPT_TEMPLATE
            .replace("{kind}", kind_name)
            .replace("{text}", text);
        let schema = extract_schema();

        let mut last_err: Option<AppError> = None;
        for attempt in 0..SCHEMA_RETRIES {
            if attempt > 0 {
                // 1s, 2s, 4s — same ladder as transport retries.
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!("Extraction schema retry {attempt} after {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            let value = match self
                .llm
                .complete(&prompt, EXTRACT_SYSTEM, &schema, CompletionParams::default())
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    let mapped = map_llm_error(e);
                    if matches!(mapped, AppError::InvalidSchema(_)) {
                        last_err = Some(mapped);
                        continue;
                    }
                    return Err(mapped);
                }
            };

            match parse_reply(value) {
                Ok(raw) => return Ok(raw),
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::InvalidSchema("no reply".to_string())))
    }
}

fn map_llm_error(e: LlmError) -> AppError {
    match e {
        LlmError::Api { status: 429, .. } | LlmError::Throttled { .. } => {
            AppError::ExtractorThrottled
        }
        LlmError::Api { status, message } => {
            AppError::ExtractorUnavailable(format!("status {status}: {message}"))
        }
        LlmError::Http(e) => AppError::ExtractorUnavailable(e.to_string()),
        LlmError::Parse(e) => AppError::InvalidSchema(e.to_string()),
        LlmError::EmptyContent => AppError::InvalidSchema("empty reply".to_string()),
    }
}

/// Parses a reply and enforces the count bounds (≤20 skills, ≤10
/// responsibilities). Anything over the cap is a schema violation, not a
/// truncation candidate: the model was told the limits.
fn parse_reply(value: serde_json::Value) -> Result<RawExtraction, AppError> {
    let raw: RawExtraction =
        serde_json::from_value(value).map_err(|e| AppError::InvalidSchema(e.to_string()))?;
    if raw.skills.len() > SKILL_SLOTS {
        return Err(AppError::InvalidSchema(format!(
            "{} skills exceeds cap {SKILL_SLOTS}",
            raw.skills.len()
        )));
    }
    if raw.responsibilities.len() > RESP_SLOTS {
        return Err(AppError::InvalidSchema(format!(
            "{} responsibilities exceeds cap {RESP_SLOTS}",
            raw.responsibilities.len()
        )));
    }
    Ok(raw)
}

/// Dedup (case-insensitive), drop empties, clip to the byte cap, pad to the
/// fixed cardinality.
fn normalize_list(items: &[String], slots: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(slots);
    for item in items {
        let trimmed = item.trim();
        if trimmed.is_empty() || trimmed == PAD_SENTINEL {
            continue;
        }
        let folded = trimmed.to_lowercase();
        if !seen.insert(folded) {
            continue;
        }
        let mut entry = trimmed.to_string();
        if entry.len() > crate::models::MAX_PHRASE_BYTES {
            entry = truncate_utf8(&entry, crate::models::MAX_PHRASE_BYTES);
        }
        out.push(entry);
        if out.len() == slots {
            break;
        }
    }
    out.resize(slots, PAD_SENTINEL.to_string());
    out
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn normalize(raw: RawExtraction) -> Result<Structured, AppError> {
    let years = if raw.years_experience.is_finite() {
        raw.years_experience.max(0.0)
    } else {
        0.0
    };
    let structured = Structured {
        job_title: raw.job_title.trim().to_string(),
        category: raw.category.trim().to_string(),
        skills: normalize_list(&raw.skills, SKILL_SLOTS),
        responsibilities: normalize_list(&raw.responsibilities, RESP_SLOTS),
        years_experience: years,
        masked_pii: MaskedPii::default(),
    };
    structured.validate()?;
    Ok(structured)
}

/// Splits `text` into windows of at most `window` chars with `overlap` chars
/// carried between consecutive windows.
pub fn chunk_windows(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= window {
        return vec![text.to_string()];
    }
    let step = window - overlap;
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + window).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

/// Union across windows ranked by frequency × recency weight. Earlier
/// windows carry more weight (document headers list the salient items
/// first); ties resolve by first appearance, keeping the merge stable.
fn merge_ranked<'a>(lists: impl Iterator<Item = &'a [String]>, slots: usize) -> Vec<String> {
    #[derive(Debug)]
    struct Entry {
        display: String,
        score: f32,
        first_seen: usize,
    }

    let mut entries: Vec<Entry> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut order = 0usize;

    for (window_idx, list) in lists.enumerate() {
        let recency_weight = 0.9_f32.powi(window_idx as i32);
        for item in list {
            let trimmed = item.trim();
            if trimmed.is_empty() || trimmed == PAD_SENTINEL {
                continue;
            }
            let folded = trimmed.to_lowercase();
            match index.get(&folded) {
                Some(&i) => entries[i].score += recency_weight,
                None => {
                    index.insert(folded, entries.len());
                    entries.push(Entry {
                        display: trimmed.to_string(),
                        score: recency_weight,
                        first_seen: order,
                    });
                    order += 1;
                }
            }
        }
    }

    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_seen.cmp(&b.first_seen))
    });
    entries
        .into_iter()
        .take(slots)
        .map(|e| e.display)
        .collect()
}

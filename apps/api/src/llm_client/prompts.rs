// All LLM prompt constants for document extraction.

use serde_json::{json, Value};

/// Bumped whenever the prompt or schema changes; part of the extraction
/// cache key so stale cached records never leak across versions.
pub const PROMPT_VERSION: &str = "v3";

/// System prompt for structured extraction — enforces JSON-only output.
pub const EXTRACT_SYSTEM: &str =
    "You are an expert recruiter and document analyst. \
    Extract structured hiring signals from a CV or job description. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Extraction prompt template. Replace `{kind}` and `{text}` before sending.
pub const EXTRACT_PROMPT_TEMPLATE: &str = r#"Extract structured information from the following {kind}.

Return a JSON object with this EXACT schema (no extra fields):
{
  "job_title": "Data Engineer",
  "category": "Software Engineering",
  "skills": ["python", "airflow"],
  "responsibilities": ["Designs and operates batch data pipelines."],
  "years_experience": 4.0
}

Rules:

SKILLS: Up to 20 short phrases (1-4 words each), most important first.
List concrete technologies, tools, and competencies. Lowercase unless the
term is a proper noun. Do not repeat a skill in different spellings.

RESPONSIBILITIES: Up to 10 single sentences, most important first. Each
sentence describes one duty in the third person.

YEARS_EXPERIENCE: A non-negative number. For a CV: total relevant years.
For a job description: the minimum years required. When the text states a
range, use the LOWER bound. Use 0 when the text is silent.

CATEGORY: One short free-form class tag such as "Software Engineering",
"Logistics", "Finance", "Healthcare", "Sales".

Document follows:

---
{text}
---"#;

/// JSON schema sent alongside the prompt. The reply must parse against it.
pub fn extract_schema() -> Value {
    json!({
        "type": "object",
        "required": ["job_title", "category", "skills", "responsibilities", "years_experience"],
        "additionalProperties": false,
        "properties": {
            "job_title": { "type": "string" },
            "category": { "type": "string" },
            "skills": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": 20
            },
            "responsibilities": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": 10
            },
            "years_experience": { "type": "number", "minimum": 0 }
        }
    })
}

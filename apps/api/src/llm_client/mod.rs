/// LLM Client — the single point of entry for all completion calls.
///
/// ARCHITECTURAL RULE: no other module may call the completion API directly.
/// Extraction must stay deterministic, so every request pins temperature 0,
/// top_p 1, and a fixed seed, and demands a strict JSON reply.
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The model used for all extraction calls. Hardcoded to prevent drift; it
/// participates in the extraction cache key.
pub const MODEL: &str = "claude-sonnet-4-5";
/// Structured replies fit comfortably in this budget (~1200 tokens).
const MAX_TOKENS: u32 = 1200;
const MAX_RETRIES: u32 = 3;
/// Fixed sampling seed carried with every request.
pub const SEED: u64 = 7;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Throttled after {retries} retries")]
    Throttled { retries: u32 },

    #[error("LLM returned empty content")]
    EmptyContent,
}

impl LlmError {
    /// Status codes retried with the 1 s / 2 s / 4 s ladder.
    fn status_is_retryable(status: u16) -> bool {
        matches!(status, 429 | 502 | 503 | 504)
    }
}

/// Deterministic sampling parameters sent with every request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompletionParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    /// Fixed seed requested for sampling. Backends without a seed
    /// parameter accept but cannot transmit it; see [`LlmClient::call`].
    pub seed: u64,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: MAX_TOKENS,
            seed: SEED,
        }
    }
}

/// Narrow completion interface so property tests can substitute a double.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Completes `prompt` under `system`, returning the parsed JSON reply.
    /// The reply must conform to `schema`; callers validate field-level
    /// constraints themselves.
    async fn complete(
        &self,
        prompt: &str,
        system: &str,
        schema: &Value,
        params: CompletionParams,
    ) -> Result<Value, LlmError>;

    /// Model identifier for cache keys and stored records.
    fn model_id(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LlmResponse {
    /// Extracts the text content from the first text block.
    pub fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// Anthropic-backed implementation of [`Llm`]. Retries throttling and
/// gateway failures with exponential backoff before giving up.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
        }
    }

    async fn call(
        &self,
        prompt: &str,
        system: &str,
        params: CompletionParams,
    ) -> Result<LlmResponse, LlmError> {
        // The Messages API has no seed parameter, so `params.seed` cannot
        // be transmitted to this backend; sending an unknown field would be
        // rejected. Reproducibility here rests on temperature 0 and top_p 1
        // plus the extraction cache. The seed still rides in the params so
        // a seed-capable backend behind [`Llm`] honors it.
        let request_body = AnthropicRequest {
            model: MODEL,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "LLM call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if LlmError::status_is_retryable(status.as_u16()) {
                let body = response.text().await.unwrap_or_default();
                warn!("LLM API returned {}: {}", status, body);
                last_error = Some(LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<AnthropicError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let llm_response: LlmResponse = response.json().await?;

            debug!(
                "LLM call succeeded: input_tokens={}, output_tokens={}",
                llm_response.usage.input_tokens, llm_response.usage.output_tokens
            );

            return Ok(llm_response);
        }

        Err(last_error.unwrap_or(LlmError::Throttled {
            retries: MAX_RETRIES,
        }))
    }
}

#[async_trait]
impl Llm for LlmClient {
    async fn complete(
        &self,
        prompt: &str,
        system: &str,
        schema: &Value,
        params: CompletionParams,
    ) -> Result<Value, LlmError> {
        // The schema rides in the system prompt; replies that stray from it
        // fail the serde parse below and surface as InvalidSchema upstream.
        let system = format!(
            "{system}\n\nReply with a single JSON object conforming to this schema, no prose:\n{schema}"
        );
        let response = self.call(prompt, &system, params).await?;
        let text = response.text().ok_or(LlmError::EmptyContent)?;
        let text = strip_json_fences(text);
        serde_json::from_str(text).map_err(LlmError::Parse)
    }

    fn model_id(&self) -> &str {
        MODEL
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

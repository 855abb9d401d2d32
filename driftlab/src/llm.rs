//! Language model client.
//!
//! Stages talk to the model through the `LanguageModel` trait so tests can
//! script completions. The HTTP implementation maps transport and status
//! failures onto a closed set of error kinds that the retry classifier can
//! judge without string matching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::ErrorDisposition;

const DEFAULT_ENDPOINT: &str = "http://localhost:8080/v1/complete";
const DEFAULT_MODEL: &str = "drift-research-large";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Closed set of completion failures.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by model endpoint")]
    RateLimit,

    #[error("model endpoint error: {0}")]
    Server(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed model request: {0}")]
    BadRequest(String),

    #[error("model endpoint rejected credentials")]
    Auth,
}

/// Retry disposition for a completion failure. Rate limits, server errors,
/// and timeouts are transient; bad requests and auth failures will not get
/// better with repetition.
pub fn classify_llm_error(err: &LlmError) -> ErrorDisposition {
    match err {
        LlmError::RateLimit | LlmError::Server(_) | LlmError::Timeout(_) => {
            ErrorDisposition::Retriable
        }
        LlmError::BadRequest(_) | LlmError::Auth => ErrorDisposition::Fatal,
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    completion: String,
}

/// HTTP completion client configured from the environment.
pub struct HttpLanguageModel {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpLanguageModel {
    /// Build a client from `DRIFTLAB_LLM_URL`, `DRIFTLAB_LLM_API_KEY` and
    /// `DRIFTLAB_LLM_MODEL`, falling back to local defaults when unset.
    pub fn from_env() -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: std::env::var("DRIFTLAB_LLM_URL")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            api_key: std::env::var("DRIFTLAB_LLM_API_KEY").ok(),
            model: std::env::var("DRIFTLAB_LLM_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: DEFAULT_MAX_TOKENS,
        };

        let mut builder = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout)
            } else {
                LlmError::Server(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimit);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LlmError::Auth);
        }
        if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::BadRequest(body));
        }
        if status.is_server_error() {
            return Err(LlmError::Server(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(LlmError::Server(format!("unexpected status {status}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Server(format!("malformed completion body: {e}")))?;
        Ok(parsed.completion)
    }
}

/// Strip markdown code fences from a model completion, returning the JSON
/// payload. Models wrap structured answers in ```json fences more often than
/// not; tolerate both fenced and bare output.
pub fn extract_json(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

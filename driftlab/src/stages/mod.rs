//! Pipeline stage implementations.
//!
//! Each stage is a free async function from its inputs to a `StageOutputs`
//! delta; the engine owns sequencing, persistence, and provenance. The LLM
//! stages share one retry-wrapped completion helper.

pub mod analyze;
pub mod execute;
pub mod recommend;
pub mod synthesize;

use crate::llm::{classify_llm_error, LanguageModel, LlmError};
use crate::models::Stage;
use crate::retry::{call_with_retry, RetryError, RetryPolicy};

/// A stage failure. Parse failures are not retried: resending the same
/// prompt after a well-formed HTTP exchange mostly burns quota.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Llm(#[from] RetryError<LlmError>),

    #[error("{stage} stage returned unusable output: {message}")]
    Parse { stage: Stage, message: String },
}

pub(crate) async fn complete_with_retry(
    llm: &dyn LanguageModel,
    policy: &RetryPolicy,
    prompt: &str,
) -> Result<String, StageError> {
    let text = call_with_retry(policy, classify_llm_error, || llm.complete(prompt)).await?;
    Ok(text)
}

pub(crate) fn parse_error(stage: Stage, message: impl Into<String>) -> StageError {
    StageError::Parse {
        stage,
        message: message.into(),
    }
}

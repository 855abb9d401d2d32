//! Analyze stage: derive the experiment goal and term context from the
//! document set.

use serde::Deserialize;

use super::{complete_with_retry, parse_error, StageError};
use crate::llm::{extract_json, LanguageModel};
use crate::models::{Document, Stage, StageOutputs};
use crate::retry::RetryPolicy;

const PREVIEW_LIMIT: usize = 400;

#[derive(Deserialize)]
struct AnalyzeResponse {
    experiment_goal: String,
    term_context: String,
}

pub async fn analyze(
    llm: &dyn LanguageModel,
    policy: &RetryPolicy,
    experiment_id: i64,
    documents: &[Document],
) -> Result<StageOutputs, StageError> {
    let prompt = build_prompt(experiment_id, documents);
    tracing::info!(experiment_id, documents = documents.len(), "analyzing corpus");

    let completion = complete_with_retry(llm, policy, &prompt).await?;
    let payload = extract_json(&completion);
    let parsed: AnalyzeResponse = serde_json::from_str(&payload)
        .map_err(|e| parse_error(Stage::Analyze, e.to_string()))?;

    Ok(StageOutputs {
        experiment_goal: Some(parsed.experiment_goal),
        term_context: Some(parsed.term_context),
        ..Default::default()
    })
}

fn build_prompt(experiment_id: i64, documents: &[Document]) -> String {
    let mut listing = String::new();
    for doc in documents {
        let preview: String = doc.content_preview.chars().take(PREVIEW_LIMIT).collect();
        listing.push_str(&format!(
            "- id: {}\n  title: {}\n  preview: {}\n",
            doc.id, doc.title, preview
        ));
    }

    format!(
        r#"You are analyzing a corpus for a semantic drift experiment (experiment {experiment_id}).
The corpus tracks how a word's meaning changed over time.

Documents:
{listing}
Determine what this experiment is investigating and summarize the historical
context of the term under study across these documents.

Respond with JSON only:
{{
  "experiment_goal": "one-sentence statement of what the experiment investigates",
  "term_context": "short summary of the term's usage context across the corpus"
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_every_document_and_truncates_previews() {
        let documents = vec![
            Document {
                id: "7".to_string(),
                title: "Sermons 1850".to_string(),
                content_preview: "x".repeat(1000),
                metadata: serde_json::Value::Null,
            },
            Document {
                id: "8".to_string(),
                title: "Radio Times 1935".to_string(),
                content_preview: "broadcast schedule".to_string(),
                metadata: serde_json::Value::Null,
            },
        ];

        let prompt = build_prompt(42, &documents);
        assert!(prompt.contains("experiment 42"));
        assert!(prompt.contains("id: 7"));
        assert!(prompt.contains("id: 8"));
        assert!(prompt.contains("Radio Times 1935"));
        assert!(!prompt.contains(&"x".repeat(PREVIEW_LIMIT + 1)));
    }
}

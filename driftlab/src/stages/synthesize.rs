//! Synthesize stage: turn per-document tool results into cross-document
//! findings about the term's evolution.

use serde::Deserialize;

use super::{complete_with_retry, parse_error, StageError};
use crate::llm::{extract_json, LanguageModel};
use crate::models::{Document, Stage, StageOutputs, ToolOutcome};
use crate::retry::RetryPolicy;

const RESULT_LIMIT: usize = 600;

#[derive(Deserialize)]
struct SynthesizeResponse {
    cross_document_insights: String,
    term_evolution_analysis: String,
}

pub async fn synthesize(
    llm: &dyn LanguageModel,
    policy: &RetryPolicy,
    documents: &[Document],
    outputs: &StageOutputs,
) -> Result<StageOutputs, StageError> {
    let prompt = build_prompt(documents, outputs);
    tracing::info!(documents = documents.len(), "synthesizing findings");

    let completion = complete_with_retry(llm, policy, &prompt).await?;
    let payload = extract_json(&completion);
    let parsed: SynthesizeResponse = serde_json::from_str(&payload)
        .map_err(|e| parse_error(Stage::Synthesize, e.to_string()))?;

    Ok(StageOutputs {
        cross_document_insights: Some(parsed.cross_document_insights),
        term_evolution_analysis: Some(parsed.term_evolution_analysis),
        ..Default::default()
    })
}

fn build_prompt(documents: &[Document], outputs: &StageOutputs) -> String {
    let goal = outputs.experiment_goal.as_deref().unwrap_or("(not recorded)");
    let term_context = outputs.term_context.as_deref().unwrap_or("(not recorded)");

    let mut results_listing = String::new();
    if let Some(results) = &outputs.processing_results {
        for (doc_id, cells) in results {
            let title = documents
                .iter()
                .find(|d| &d.id == doc_id)
                .map(|d| d.title.as_str())
                .unwrap_or("(unknown)");
            results_listing.push_str(&format!("Document {doc_id} ({title}):\n"));
            for (tool, outcome) in cells {
                match outcome {
                    ToolOutcome::Success { value } => {
                        let compact =
                            serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
                        let truncated: String = compact.chars().take(RESULT_LIMIT).collect();
                        results_listing.push_str(&format!("  {tool}: {truncated}\n"));
                    }
                    ToolOutcome::Error { message } => {
                        results_listing.push_str(&format!("  {tool}: FAILED: {message}\n"));
                    }
                }
            }
        }
    }

    format!(
        r#"You are synthesizing the results of a semantic drift experiment.

Goal: {goal}
Term context: {term_context}

Tool results per document (some cells may have FAILED; work with what
succeeded and do not invent data for failed cells):
{results_listing}
Respond with JSON only:
{{
  "cross_document_insights": "patterns that hold across the document set",
  "term_evolution_analysis": "how the term's meaning shifted over the corpus timeline"
}}"#
    )
}

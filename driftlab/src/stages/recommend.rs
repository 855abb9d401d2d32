//! Recommend stage: have the model propose a per-document tool strategy,
//! then repair the proposal into something executable.
//!
//! Model output is advice, not ground truth. Unknown tools are dropped,
//! documents the model skipped get the full available tool list, and keys
//! for documents outside the run are ignored. Each repair is logged.

use serde::Deserialize;
use std::collections::HashSet;

use super::{complete_with_retry, parse_error, StageError};
use crate::llm::{extract_json, LanguageModel};
use crate::models::{Document, Stage, StageOutputs, Strategy};
use crate::retry::RetryPolicy;

#[derive(Deserialize)]
struct RecommendResponse {
    strategy: Strategy,
    reasoning: String,
    confidence: f64,
}

#[allow(clippy::too_many_arguments)]
pub async fn recommend(
    llm: &dyn LanguageModel,
    policy: &RetryPolicy,
    documents: &[Document],
    tool_descriptions: &[(String, String)],
    goal: &str,
    term_context: &str,
) -> Result<StageOutputs, StageError> {
    let prompt = build_prompt(documents, tool_descriptions, goal, term_context);
    tracing::info!(documents = documents.len(), "recommending processing strategy");

    let completion = complete_with_retry(llm, policy, &prompt).await?;
    let payload = extract_json(&completion);
    let parsed: RecommendResponse = serde_json::from_str(&payload)
        .map_err(|e| parse_error(Stage::Recommend, e.to_string()))?;

    if !parsed.confidence.is_finite() {
        return Err(parse_error(
            Stage::Recommend,
            format!("confidence is not a number: {}", parsed.confidence),
        ));
    }

    let available: Vec<String> = tool_descriptions.iter().map(|(n, _)| n.clone()).collect();
    let strategy = repair_strategy(parsed.strategy, documents, &available);

    Ok(StageOutputs {
        recommended_strategy: Some(strategy),
        strategy_reasoning: Some(parsed.reasoning),
        confidence: Some(parsed.confidence.clamp(0.0, 1.0)),
        ..Default::default()
    })
}

/// Coerce a model-proposed strategy into one that covers exactly the run's
/// documents using only available tools.
fn repair_strategy(
    proposed: Strategy,
    documents: &[Document],
    available: &[String],
) -> Strategy {
    let known_tools: HashSet<&str> = available.iter().map(String::as_str).collect();
    let known_docs: HashSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();

    let mut strategy = Strategy::new();
    for (doc_id, tools) in proposed {
        if !known_docs.contains(doc_id.as_str()) {
            tracing::warn!(document = %doc_id, "strategy names a document outside the run, ignoring");
            continue;
        }
        let kept: Vec<String> = tools
            .into_iter()
            .filter(|tool| {
                let known = known_tools.contains(tool.as_str());
                if !known {
                    tracing::warn!(document = %doc_id, tool = %tool, "dropping unknown tool from strategy");
                }
                known
            })
            .collect();
        strategy.insert(doc_id, kept);
    }

    for doc in documents {
        let entry = strategy.entry(doc.id.clone()).or_default();
        if entry.is_empty() {
            tracing::warn!(document = %doc.id, "strategy left a document uncovered, assigning all available tools");
            *entry = available.to_vec();
        }
    }

    strategy
}

fn build_prompt(
    documents: &[Document],
    tool_descriptions: &[(String, String)],
    goal: &str,
    term_context: &str,
) -> String {
    let mut doc_listing = String::new();
    for doc in documents {
        doc_listing.push_str(&format!("- id: {} ({})\n", doc.id, doc.title));
    }

    let mut tool_listing = String::new();
    for (name, description) in tool_descriptions {
        tool_listing.push_str(&format!("- {name}: {description}\n"));
    }

    format!(
        r#"You are planning document processing for a semantic drift experiment.

Goal: {goal}
Term context: {term_context}

Documents:
{doc_listing}
Available tools:
{tool_listing}
Assign each document an ordered list of tools to run on it. Use only the
tools listed above and cover every document.

Respond with JSON only:
{{
  "strategy": {{ "<document id>": ["<tool name>", ...], ... }},
  "reasoning": "why these tools suit these documents",
  "confidence": 0.0
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<Document> {
        ["7", "8"]
            .into_iter()
            .map(|id| Document {
                id: id.to_string(),
                title: format!("doc {id}"),
                content_preview: String::new(),
                metadata: serde_json::Value::Null,
            })
            .collect()
    }

    fn available() -> Vec<String> {
        vec!["extract_entities".to_string(), "term_frequency".to_string()]
    }

    #[test]
    fn repair_drops_unknown_tools() {
        let mut proposed = Strategy::new();
        proposed.insert(
            "7".to_string(),
            vec!["term_frequency".to_string(), "sentiment".to_string()],
        );
        proposed.insert("8".to_string(), vec!["extract_entities".to_string()]);

        let repaired = repair_strategy(proposed, &docs(), &available());
        assert_eq!(repaired["7"], vec!["term_frequency"]);
        assert_eq!(repaired["8"], vec!["extract_entities"]);
    }

    #[test]
    fn repair_covers_skipped_documents_with_all_tools() {
        let mut proposed = Strategy::new();
        proposed.insert("7".to_string(), vec!["term_frequency".to_string()]);

        let repaired = repair_strategy(proposed, &docs(), &available());
        assert_eq!(repaired["8"], available());
    }

    #[test]
    fn repair_ignores_documents_outside_the_run() {
        let mut proposed = Strategy::new();
        proposed.insert("999".to_string(), vec!["term_frequency".to_string()]);

        let repaired = repair_strategy(proposed, &docs(), &available());
        assert!(!repaired.contains_key("999"));
        assert_eq!(repaired.len(), 2);
    }

    #[test]
    fn document_left_with_only_unknown_tools_gets_full_list() {
        let mut proposed = Strategy::new();
        proposed.insert("7".to_string(), vec!["sentiment".to_string()]);
        proposed.insert("8".to_string(), vec!["term_frequency".to_string()]);

        let repaired = repair_strategy(proposed, &docs(), &available());
        assert_eq!(repaired["7"], available());
    }
}

//! Execute stage: run the approved strategy, tool by tool, document by
//! document.
//!
//! A tool failure never aborts the stage; it becomes an error marker in that
//! document's result cell and the remaining work proceeds. Documents and
//! tools run in deterministic order, and the cancellation flag is checked
//! before each tool invocation.

use std::collections::BTreeMap;

use crate::models::{Document, ProcessingResults, Strategy, ToolOutcome};
use crate::retry::RetryPolicy;
use crate::tools::ToolRegistry;

/// Result of the Execute stage.
pub struct ExecuteOutcome {
    pub results: ProcessingResults,
    /// True when a cancellation request stopped the stage early. Partial
    /// results are discarded by the caller in that case.
    pub cancelled: bool,
}

pub async fn execute<F>(
    registry: &ToolRegistry,
    policy: &RetryPolicy,
    documents: &[Document],
    strategy: &Strategy,
    mut cancelled: F,
) -> ExecuteOutcome
where
    F: FnMut() -> bool,
{
    let mut results: ProcessingResults = BTreeMap::new();

    for (doc_id, tool_names) in strategy {
        let Some(document) = documents.iter().find(|d| &d.id == doc_id) else {
            // Validated upstream; skipping keeps the stage total.
            tracing::warn!(document = %doc_id, "strategy references a missing document, skipping");
            continue;
        };

        let cells = results.entry(doc_id.clone()).or_default();
        for tool_name in tool_names {
            if cancelled() {
                tracing::info!(document = %doc_id, tool = %tool_name, "cancellation requested, stopping execution");
                return ExecuteOutcome {
                    results,
                    cancelled: true,
                };
            }

            let outcome = match registry.execute(tool_name, document, policy).await {
                Ok(value) => ToolOutcome::Success { value },
                Err(err) => {
                    let message = format!(
                        "tool {} failed on document {}: {}",
                        tool_name,
                        doc_id,
                        err
                    );
                    tracing::warn!(document = %doc_id, tool = %tool_name, error = %err, "tool failed");
                    ToolOutcome::Error { message }
                }
            };
            cells.insert(tool_name.clone(), outcome);
        }
    }

    ExecuteOutcome {
        results,
        cancelled: false,
    }
}

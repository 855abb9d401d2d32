//! SDK for creating driftlab processing tools.
//!
//! A processing tool analyzes one document and returns a JSON value. Tools
//! are registered with the engine by name and invoked by the Execute stage
//! according to the approved per-document strategy. This crate carries only
//! the types a tool implementation needs, so external tool crates do not
//! depend on the engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// Re-export async trait for convenience
pub use async_trait::async_trait;

/// Read-only snapshot of a corpus document, supplied by the document
/// subsystem at run creation. The engine never mutates the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content_preview: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Failure of a single tool invocation.
///
/// A `Timeout` is transient and retried by the engine; the other kinds fail
/// that result cell permanently. No tool error ever fails the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool input rejected: {0}")]
    InvalidInput(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
}

/// Trait that processing tools must implement.
#[async_trait]
pub trait ProcessingTool: Send + Sync {
    /// Registry name, e.g. `extract_temporal`.
    fn name(&self) -> &str;

    /// One-line description shown to the Recommend stage.
    fn description(&self) -> &str;

    /// Analyze one document and return a JSON result.
    async fn run(&self, document: &Document) -> Result<serde_json::Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_roundtrips_without_metadata() {
        let json = r#"{"id": "7", "title": "Sermons 1850", "content_preview": "..."}"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(doc.id, "7");
        assert_eq!(doc.metadata, serde_json::Value::Null);

        let back = serde_json::to_string(&doc).unwrap();
        let again: Document = serde_json::from_str(&back).unwrap();
        assert_eq!(doc, again);
    }
}

//! Orchestration engine for semantic drift experiments.
//!
//! A workflow run moves a document set through five stages (Analyze,
//! Recommend, Review, Execute, Synthesize), suspending at Review for a
//! human decision. Runs are durable in SQLite, every stage output is
//! recorded in an append-only provenance graph, and external calls (the
//! language model, the processing tools) go through bounded retry.

pub mod database;
pub mod engine;
pub mod error;
pub mod llm;
pub mod models;
pub mod provenance;
pub mod retry;
pub mod stages;
pub mod tools;

pub use engine::WorkflowEngine;
pub use error::EngineError;
pub use models::{
    Document, RunSnapshot, RunStatus, Stage, StageOutputs, Strategy, ToolOutcome,
};
pub use retry::RetryPolicy;
pub use tools::ToolRegistry;

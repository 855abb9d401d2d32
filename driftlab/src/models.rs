//! Data model for workflow runs.
//!
//! A run is one execution of the five-stage pipeline for one experiment. Its
//! stage outputs form a monotonically growing record: each stage fills its
//! own fields and nothing ever resets a field that an earlier stage produced,
//! so "not yet computed" is always distinguishable from "computed empty".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub use driftlab_sdk::Document;

/// Per-document assignment of an ordered list of processing tool names.
pub type Strategy = BTreeMap<String, Vec<String>>;

/// Per-document, per-tool result-or-error map produced by the Execute stage.
pub type ProcessingResults = BTreeMap<String, BTreeMap<String, ToolOutcome>>;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Analyzing,
    Recommending,
    AwaitingReview,
    Executing,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Analyzing => "analyzing",
            RunStatus::Recommending => "recommending",
            RunStatus::AwaitingReview => "awaiting_review",
            RunStatus::Executing => "executing",
            RunStatus::Synthesizing => "synthesizing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<RunStatus> {
        match value {
            "created" => Some(RunStatus::Created),
            "analyzing" => Some(RunStatus::Analyzing),
            "recommending" => Some(RunStatus::Recommending),
            "awaiting_review" => Some(RunStatus::AwaitingReview),
            "executing" => Some(RunStatus::Executing),
            "synthesizing" => Some(RunStatus::Synthesizing),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal runs are immutable; reprocessing requires a new run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named step of the five-step pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Recommend,
    Review,
    Execute,
    Synthesize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Recommend => "recommend",
            Stage::Review => "review",
            Stage::Execute => "execute",
            Stage::Synthesize => "synthesize",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        match value {
            "analyze" => Some(Stage::Analyze),
            "recommend" => Some(Stage::Recommend),
            "review" => Some(Stage::Review),
            "execute" => Some(Stage::Execute),
            "synthesize" => Some(Stage::Synthesize),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tool invocation on one document. Failures are explicit
/// per-cell markers, never silent omissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { value: serde_json::Value },
    Error { message: String },
}

/// Named, immutable field set attached to a run, one group per stage.
///
/// Every field is optional until its producing stage completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutputs {
    // Analyze
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term_context: Option<String>,

    // Recommend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    // Review
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_strategy: Option<Strategy>,

    // Execute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_results: Option<ProcessingResults>,

    // Synthesize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_document_insights: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term_evolution_analysis: Option<String>,
}

impl StageOutputs {
    /// Merge a stage delta into the record. Only empty slots are filled; a
    /// field produced by an earlier stage is never replaced.
    pub fn merge(&mut self, delta: StageOutputs) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = delta.$field;
                }
            };
        }
        fill!(experiment_goal);
        fill!(term_context);
        fill!(recommended_strategy);
        fill!(strategy_reasoning);
        fill!(confidence);
        fill!(strategy_approved);
        fill!(review_notes);
        fill!(modified_strategy);
        fill!(processing_results);
        fill!(cross_document_insights);
        fill!(term_evolution_analysis);
    }
}

/// One execution instance of the pipeline for one experiment.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub experiment_id: i64,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub documents: Vec<Document>,
    pub available_tools: Vec<String>,
    pub outputs: StageOutputs,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(experiment_id: i64, documents: Vec<Document>, available_tools: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            status: RunStatus::Created,
            current_stage: None,
            documents,
            available_tools,
            outputs: StageOutputs::default(),
            error: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Strategy the Execute stage should run: the reviewer's modification if
    /// one was supplied, otherwise the recommendation.
    pub fn active_strategy(&self) -> Option<&Strategy> {
        self.outputs
            .modified_strategy
            .as_ref()
            .or(self.outputs.recommended_strategy.as_ref())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            experiment_id: self.experiment_id,
            status: self.status,
            current_stage: self.current_stage,
            outputs: self.outputs.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only view of a run, returned by `status`. Safe to poll arbitrarily
/// often; producing one has no side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub experiment_id: i64,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub outputs: StageOutputs,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_fills_empty_slots_only() {
        let mut outputs = StageOutputs {
            experiment_goal: Some("trace drift of 'broadcast'".to_string()),
            ..Default::default()
        };

        outputs.merge(StageOutputs {
            experiment_goal: Some("overwritten".to_string()),
            term_context: Some("agricultural vs media senses".to_string()),
            ..Default::default()
        });

        // Earlier value wins; new field lands.
        assert_eq!(
            outputs.experiment_goal.as_deref(),
            Some("trace drift of 'broadcast'")
        );
        assert_eq!(
            outputs.term_context.as_deref(),
            Some("agricultural vs media senses")
        );
    }

    #[test]
    fn merge_never_clears_a_field() {
        let mut outputs = StageOutputs {
            confidence: Some(0.8),
            ..Default::default()
        };
        outputs.merge(StageOutputs::default());
        assert_eq!(outputs.confidence, Some(0.8));
    }

    #[test]
    fn modified_strategy_takes_precedence() {
        let mut run = WorkflowRun::new(1, vec![], vec![]);
        assert!(run.active_strategy().is_none());

        let mut recommended = Strategy::new();
        recommended.insert("7".to_string(), vec!["term_frequency".to_string()]);
        run.outputs.recommended_strategy = Some(recommended);
        assert!(run.active_strategy().unwrap().contains_key("7"));

        let mut modified = Strategy::new();
        modified.insert("8".to_string(), vec!["extract_temporal".to_string()]);
        run.outputs.modified_strategy = Some(modified);
        assert!(run.active_strategy().unwrap().contains_key("8"));
        assert!(!run.active_strategy().unwrap().contains_key("7"));
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            RunStatus::Created,
            RunStatus::Analyzing,
            RunStatus::Recommending,
            RunStatus::AwaitingReview,
            RunStatus::Executing,
            RunStatus::Synthesizing,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::AwaitingReview.is_terminal());
        assert!(!RunStatus::Executing.is_terminal());
    }
}

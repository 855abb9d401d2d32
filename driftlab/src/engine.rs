//! Workflow engine: sequences the five stages over a durable run record.
//!
//! One rule governs error surfacing: problems with the *request* (conflicts,
//! unknown runs or tools, wrong state) come back as `Err` before any state
//! changes, while problems inside a *running stage* never escape as `Err`.
//! The run is marked failed with a human-readable reason and the call
//! returns normally. Callers observe stage failures through `status`.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::database::{Database, StoreError};
use crate::error::EngineError;
use crate::llm::LanguageModel;
use crate::models::{
    Document, RunSnapshot, RunStatus, Stage, StageOutputs, Strategy, WorkflowRun,
};
use crate::provenance::{ProvenanceGraph, ProvenanceRecorder, USED};
use crate::retry::RetryPolicy;
use crate::stages;
use crate::tools::ToolRegistry;

pub struct WorkflowEngine {
    store: Arc<Database>,
    llm: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    retry: RetryPolicy,
    provenance: ProvenanceRecorder,
    agent: String,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<Database>,
        llm: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        let provenance = ProvenanceRecorder::new(store.clone());
        Self {
            store,
            llm,
            tools,
            retry,
            provenance,
            agent: format!("driftlab-engine/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Start a new run for an experiment and drive it to the review gate.
    ///
    /// Returns the run ID as soon as the run is durably created; if a stage
    /// fails afterwards the ID is still returned and the failure is visible
    /// via `status`. An empty `available_tools` means every registered tool.
    pub async fn start(
        &self,
        experiment_id: i64,
        documents: Vec<Document>,
        available_tools: Vec<String>,
    ) -> Result<Uuid, EngineError> {
        let available_tools = if available_tools.is_empty() {
            self.tools.names()
        } else {
            if let Some(unknown) = self
                .tools
                .first_unknown(available_tools.iter().map(String::as_str))
            {
                return Err(EngineError::UnknownTool(unknown));
            }
            available_tools
        };

        let mut run = WorkflowRun::new(experiment_id, documents, available_tools);
        self.store.insert_run(&run).map_err(|e| match e {
            StoreError::ActiveRunExists { experiment_id } => {
                EngineError::Conflict { experiment_id }
            }
            other => EngineError::Store(other),
        })?;
        tracing::info!(run_id = %run.id, experiment_id, "run created");

        run.started_at = Some(Utc::now());
        self.store.update_run(&run)?;

        // Ingest provenance: the documents are the root entity everything
        // else derives from.
        let now = Utc::now();
        let ingest = self
            .provenance
            .record_activity(run.id, "ingest", &self.agent, now, now)?;
        self.provenance.record_entity(
            run.id,
            "input_documents",
            serde_json::to_value(&run.documents).map_err(StoreError::Serialize)?,
            ingest,
            None,
        )?;

        let run_id = run.id;
        self.drive_to_review(&mut run).await?;
        Ok(run_id)
    }

    /// Apply a review decision to a suspended run and, if approved, drive it
    /// through Execute and Synthesize to completion.
    ///
    /// The modified strategy (when supplied) is validated against the run's
    /// documents and the registry before any state changes.
    pub async fn resume(
        &self,
        run_id: Uuid,
        approved: bool,
        modified_strategy: Option<Strategy>,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        let mut run = self.load(&run_id)?;
        if run.status != RunStatus::AwaitingReview {
            return Err(EngineError::InvalidState {
                run_id,
                status: run.status,
            });
        }

        if let Some(strategy) = &modified_strategy {
            for (doc_id, tools) in strategy {
                if !run.documents.iter().any(|d| &d.id == doc_id) {
                    return Err(EngineError::UnknownDocument(doc_id.clone()));
                }
                if let Some(unknown) =
                    self.tools.first_unknown(tools.iter().map(String::as_str))
                {
                    return Err(EngineError::UnknownTool(unknown));
                }
            }
        }

        // Claim the review gate with a conditional write so two concurrent
        // resume calls admit exactly one; the loser sees whatever state the
        // winner left behind.
        if !self.store.transition_status(
            &run_id,
            RunStatus::AwaitingReview,
            RunStatus::Executing,
        )? {
            let status = self.load(&run_id)?.status;
            return Err(EngineError::InvalidState { run_id, status });
        }
        run.status = RunStatus::Executing;

        tracing::info!(run_id = %run_id, approved, "review decision received");

        // The review outcome is itself a stage output, chained to whatever
        // entity was recorded last before the suspension.
        let review_started = Utc::now();
        let delta = StageOutputs {
            strategy_approved: Some(approved),
            review_notes: notes.clone(),
            modified_strategy,
            ..Default::default()
        };
        let derived_from = self.provenance.latest_entity(&run_id)?;
        let review_entity =
            self.complete_stage(&mut run, Stage::Review, delta, review_started, derived_from)?;

        if !approved {
            let reason = format!(
                "rejected by reviewer: {}",
                notes.as_deref().unwrap_or("(no notes)")
            );
            return self.fail_run(&mut run, Stage::Review, &reason);
        }

        // Execute
        if !self.begin_stage(&mut run, Stage::Execute, RunStatus::Executing)? {
            return Ok(());
        }
        let started = Utc::now();
        let strategy = run.active_strategy().cloned().unwrap_or_default();
        let store = self.store.clone();
        let outcome = stages::execute::execute(
            &self.tools,
            &self.retry,
            &run.documents,
            &strategy,
            || store.cancel_requested(&run_id).unwrap_or(false),
        )
        .await;
        if outcome.cancelled {
            return self.mark_cancelled(&mut run);
        }
        let delta = StageOutputs {
            processing_results: Some(outcome.results),
            ..Default::default()
        };
        let execute_entity =
            self.complete_stage(&mut run, Stage::Execute, delta, started, Some(review_entity))?;

        // Synthesize
        if !self.begin_stage(&mut run, Stage::Synthesize, RunStatus::Synthesizing)? {
            return Ok(());
        }
        let started = Utc::now();
        let delta = match stages::synthesize::synthesize(
            self.llm.as_ref(),
            &self.retry,
            &run.documents,
            &run.outputs,
        )
        .await
        {
            Ok(delta) => delta,
            Err(e) => return self.fail_run(&mut run, Stage::Synthesize, &e.to_string()),
        };
        if self.cancelled_at_boundary(&mut run)? {
            return Ok(());
        }
        self.complete_stage(&mut run, Stage::Synthesize, delta, started, Some(execute_entity))?;

        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        self.store.update_run(&run)?;
        tracing::info!(run_id = %run_id, "run completed");
        Ok(())
    }

    /// Read-only snapshot of a run. Safe to poll; never mutates anything.
    pub fn status(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        Ok(self.load(&run_id)?.snapshot())
    }

    /// The run's accumulated stage outputs so far.
    pub fn results(&self, run_id: Uuid) -> Result<StageOutputs, EngineError> {
        Ok(self.load(&run_id)?.outputs)
    }

    /// List runs, optionally filtered.
    pub fn list(
        &self,
        experiment_id: Option<i64>,
        status: Option<RunStatus>,
    ) -> Result<Vec<RunSnapshot>, EngineError> {
        let runs = self.store.list_runs(experiment_id, status)?;
        Ok(runs.iter().map(WorkflowRun::snapshot).collect())
    }

    /// Request cancellation. Idle runs (created or awaiting review) cancel
    /// immediately; running ones observe the flag at the next stage or tool
    /// boundary. Terminal runs cannot be cancelled.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut run = self.load(&run_id)?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidState {
                run_id,
                status: run.status,
            });
        }

        // Idle runs cancel immediately, but only if nothing claimed them
        // first; losing the claim (a resume got in) falls back to the flag.
        if matches!(run.status, RunStatus::Created | RunStatus::AwaitingReview)
            && self
                .store
                .transition_status(&run_id, run.status, RunStatus::Cancelled)?
        {
            run.status = RunStatus::Cancelled;
            run.completed_at = Some(Utc::now());
            self.store.update_run(&run)?;
            tracing::info!(run_id = %run_id, "run cancelled");
            return Ok(());
        }

        self.store.request_cancel(&run_id)?;
        tracing::info!(run_id = %run_id, "cancellation requested");
        Ok(())
    }

    /// Export the run's full provenance graph.
    pub fn export_provenance(&self, run_id: Uuid) -> Result<ProvenanceGraph, EngineError> {
        self.load(&run_id)?;
        Ok(self.provenance.export(&run_id)?)
    }

    // ------------------------------------------------------------------

    fn load(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        self.store.get_run(run_id).map_err(|e| match e {
            StoreError::RunNotFound(id) => EngineError::NotFound(id),
            other => EngineError::Store(other),
        })
    }

    /// Analyze then Recommend, then suspend at the review gate.
    async fn drive_to_review(&self, run: &mut WorkflowRun) -> Result<(), EngineError> {
        if !self.begin_stage(run, Stage::Analyze, RunStatus::Analyzing)? {
            return Ok(());
        }
        let started = Utc::now();
        let delta = match stages::analyze::analyze(
            self.llm.as_ref(),
            &self.retry,
            run.experiment_id,
            &run.documents,
        )
        .await
        {
            Ok(delta) => delta,
            Err(e) => return self.fail_run(run, Stage::Analyze, &e.to_string()),
        };
        if self.cancelled_at_boundary(run)? {
            return Ok(());
        }
        let derived_from = self.provenance.latest_entity(&run.id)?;
        let analyze_entity =
            self.complete_stage(run, Stage::Analyze, delta, started, derived_from)?;

        if !self.begin_stage(run, Stage::Recommend, RunStatus::Recommending)? {
            return Ok(());
        }
        let started = Utc::now();
        let descriptions = self.tools.descriptions(&run.available_tools);
        let goal = run.outputs.experiment_goal.clone().unwrap_or_default();
        let term_context = run.outputs.term_context.clone().unwrap_or_default();
        let delta = match stages::recommend::recommend(
            self.llm.as_ref(),
            &self.retry,
            &run.documents,
            &descriptions,
            &goal,
            &term_context,
        )
        .await
        {
            Ok(delta) => delta,
            Err(e) => return self.fail_run(run, Stage::Recommend, &e.to_string()),
        };
        if self.cancelled_at_boundary(run)? {
            return Ok(());
        }
        self.complete_stage(run, Stage::Recommend, delta, started, Some(analyze_entity))?;

        run.status = RunStatus::AwaitingReview;
        run.current_stage = Some(Stage::Review);
        self.store.update_run(run)?;
        tracing::info!(run_id = %run.id, "run suspended for review");
        Ok(())
    }

    /// Observe the cooperative cancel flag at a stage boundary. Returns true
    /// when the run was cancelled; the caller drops the in-flight delta.
    fn cancelled_at_boundary(&self, run: &mut WorkflowRun) -> Result<bool, EngineError> {
        if self.store.cancel_requested(&run.id)? {
            self.mark_cancelled(run)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Enter a stage unless cancellation was requested while idle. Returns
    /// false when the run was cancelled instead.
    fn begin_stage(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        status: RunStatus,
    ) -> Result<bool, EngineError> {
        if self.store.cancel_requested(&run.id)? {
            self.mark_cancelled(run)?;
            return Ok(false);
        }
        run.status = status;
        run.current_stage = Some(stage);
        self.store.update_run(run)?;
        tracing::info!(run_id = %run.id, stage = %stage, "stage started");
        Ok(true)
    }

    /// Merge a stage's delta into the run, persist it, then record the
    /// stage's provenance. The run record is written first so a crash
    /// between the two loses provenance, never outputs.
    fn complete_stage(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        delta: StageOutputs,
        started_at: chrono::DateTime<Utc>,
        derived_from: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        let value = serde_json::to_value(&delta).map_err(StoreError::Serialize)?;
        run.outputs.merge(delta);
        self.store.update_run(run)?;

        let activity = self.provenance.record_activity(
            run.id,
            stage.as_str(),
            &self.agent,
            started_at,
            Utc::now(),
        )?;
        if let Some(source) = derived_from {
            self.provenance.record_relationship(
                run.id,
                &activity.to_string(),
                USED,
                &source.to_string(),
            )?;
        }
        let entity = self.provenance.record_entity(
            run.id,
            &format!("{stage}_output"),
            value,
            activity,
            derived_from,
        )?;
        tracing::info!(run_id = %run.id, stage = %stage, "stage completed");
        Ok(entity)
    }

    fn fail_run(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        reason: &str,
    ) -> Result<(), EngineError> {
        run.status = RunStatus::Failed;
        run.error = Some(reason.to_string());
        run.completed_at = Some(Utc::now());
        self.store.update_run(run)?;
        tracing::warn!(run_id = %run.id, stage = %stage, reason, "run failed");
        Ok(())
    }

    fn mark_cancelled(&self, run: &mut WorkflowRun) -> Result<(), EngineError> {
        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        self.store.update_run(run)?;
        tracing::info!(run_id = %run.id, "run cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::models::ToolOutcome;
    use async_trait::async_trait;
    use driftlab_sdk::{ProcessingTool, ToolError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedModel {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Server("script exhausted".to_string())))
        }
    }

    /// Model whose completions park on a semaphore, so a test can hold a
    /// stage in flight while it pokes the engine from outside.
    struct GatedModel {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    impl GatedModel {
        fn new(
            responses: Vec<Result<String, LlmError>>,
            gate: Arc<tokio::sync::Semaphore>,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                gate,
            }
        }
    }

    #[async_trait]
    impl LanguageModel for GatedModel {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.gate.acquire().await.unwrap().forget();
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Server("script exhausted".to_string())))
        }
    }

    async fn wait_for_run(
        engine: &WorkflowEngine,
        experiment_id: i64,
        status: RunStatus,
    ) -> Uuid {
        for _ in 0..500 {
            if let Some(run) = engine
                .list(Some(experiment_id), Some(status))
                .unwrap()
                .into_iter()
                .next()
            {
                return run.run_id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no run reached {status}");
    }

    async fn wait_until(engine: &WorkflowEngine, run_id: Uuid, status: RunStatus) {
        for _ in 0..500 {
            if engine.status(run_id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("run never reached {status}");
    }

    fn analyze_response() -> Result<String, LlmError> {
        Ok(serde_json::json!({
            "experiment_goal": "trace drift of 'broadcast'",
            "term_context": "agricultural to media senses, 1850-1950",
        })
        .to_string())
    }

    fn recommend_response() -> Result<String, LlmError> {
        Ok(serde_json::json!({
            "strategy": {
                "7": ["term_frequency"],
                "8": ["extract_entities"],
            },
            "reasoning": "frequency for the sermons, entities for the radio listings",
            "confidence": 0.9,
        })
        .to_string())
    }

    fn synthesize_response() -> Result<String, LlmError> {
        Ok(serde_json::json!({
            "cross_document_insights": "the agricultural sense disappears after 1920",
            "term_evolution_analysis": "sowing gives way to radio transmission",
        })
        .to_string())
    }

    fn documents() -> Vec<Document> {
        vec![
            Document {
                id: "7".to_string(),
                title: "Sermons 1850".to_string(),
                content_preview: "The minister did broadcast seed upon the field in 1851."
                    .to_string(),
                metadata: serde_json::Value::Null,
            },
            Document {
                id: "8".to_string(),
                title: "Radio Times 1935".to_string(),
                content_preview: "The evening broadcast from London reached Manchester."
                    .to_string(),
                metadata: serde_json::Value::Null,
            },
        ]
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn engine_with(responses: Vec<Result<String, LlmError>>) -> WorkflowEngine {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();
        WorkflowEngine::new(
            store,
            Arc::new(ScriptedModel::new(responses)),
            Arc::new(ToolRegistry::with_builtin_tools()),
            fast_retry(),
        )
    }

    #[tokio::test]
    async fn full_run_suspends_for_review_then_completes() {
        let engine = engine_with(vec![
            analyze_response(),
            recommend_response(),
            synthesize_response(),
        ]);

        let run_id = engine.start(42, documents(), vec![]).await.unwrap();

        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::AwaitingReview);
        assert_eq!(snapshot.current_stage, Some(Stage::Review));
        let strategy = snapshot.outputs.recommended_strategy.as_ref().unwrap();
        assert!(strategy.contains_key("7"));
        assert!(strategy.contains_key("8"));
        assert_eq!(snapshot.outputs.confidence, Some(0.9));

        engine.resume(run_id, true, None, None).await.unwrap();

        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.completed_at.is_some());

        let results = snapshot.outputs.processing_results.as_ref().unwrap();
        assert!(matches!(
            results["7"]["term_frequency"],
            ToolOutcome::Success { .. }
        ));
        assert!(matches!(
            results["8"]["extract_entities"],
            ToolOutcome::Success { .. }
        ));
        assert!(snapshot.outputs.cross_document_insights.is_some());
        assert_eq!(snapshot.outputs.strategy_approved, Some(true));
    }

    #[tokio::test]
    async fn rejection_fails_the_run_with_reviewer_notes() {
        let engine = engine_with(vec![analyze_response(), recommend_response()]);
        let run_id = engine.start(1, documents(), vec![]).await.unwrap();

        engine
            .resume(run_id, false, None, Some("wrong tools".to_string()))
            .await
            .unwrap();

        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("rejected by reviewer: wrong tools")
        );
        // No processing ran; the review decision itself is still recorded.
        assert!(snapshot.outputs.processing_results.is_none());
        assert_eq!(snapshot.outputs.strategy_approved, Some(false));
        assert_eq!(snapshot.outputs.review_notes.as_deref(), Some("wrong tools"));
    }

    #[tokio::test]
    async fn reviewer_modified_strategy_replaces_the_recommendation() {
        let engine = engine_with(vec![
            analyze_response(),
            recommend_response(),
            synthesize_response(),
        ]);
        let run_id = engine.start(1, documents(), vec![]).await.unwrap();

        let mut modified = Strategy::new();
        modified.insert("7".to_string(), vec!["collocations".to_string()]);
        modified.insert("8".to_string(), vec!["extract_temporal".to_string()]);
        engine
            .resume(run_id, true, Some(modified), None)
            .await
            .unwrap();

        let results = engine.results(run_id).unwrap().processing_results.unwrap();
        assert!(results["7"].contains_key("collocations"));
        assert!(!results["7"].contains_key("term_frequency"));
        assert!(results["8"].contains_key("extract_temporal"));
    }

    struct FlakyTool;

    #[async_trait]
    impl ProcessingTool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails on document 7"
        }
        async fn run(&self, document: &Document) -> Result<serde_json::Value, ToolError> {
            if document.id == "7" {
                Err(ToolError::Execution("parser choked".to_string()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    #[tokio::test]
    async fn partial_tool_failure_still_completes_with_error_markers() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();
        let mut registry = ToolRegistry::with_builtin_tools();
        registry.register(Arc::new(FlakyTool));

        let recommend = Ok(serde_json::json!({
            "strategy": { "7": ["flaky"], "8": ["flaky"] },
            "reasoning": "r",
            "confidence": 0.5,
        })
        .to_string());
        let engine = WorkflowEngine::new(
            store,
            Arc::new(ScriptedModel::new(vec![
                analyze_response(),
                recommend,
                synthesize_response(),
            ])),
            Arc::new(registry),
            fast_retry(),
        );

        let run_id = engine.start(1, documents(), vec![]).await.unwrap();
        engine.resume(run_id, true, None, None).await.unwrap();

        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        let results = snapshot.outputs.processing_results.unwrap();
        match &results["7"]["flaky"] {
            ToolOutcome::Error { message } => {
                assert!(message.starts_with("tool flaky failed on document 7:"));
                assert!(message.contains("parser choked"));
            }
            other => panic!("expected error cell, got {other:?}"),
        }
        assert!(matches!(results["8"]["flaky"], ToolOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn exhausted_llm_retries_fail_the_run() {
        let engine = engine_with(vec![
            Err(LlmError::RateLimit),
            Err(LlmError::RateLimit),
            Err(LlmError::RateLimit),
            Err(LlmError::RateLimit),
        ]);

        let run_id = engine.start(1, documents(), vec![]).await.unwrap();

        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot
            .error
            .unwrap()
            .starts_with("exhausted retries after 4 attempts"));
    }

    #[tokio::test]
    async fn concurrent_starts_for_one_experiment_admit_exactly_one() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();

        let make_engine = || {
            WorkflowEngine::new(
                store.clone(),
                Arc::new(ScriptedModel::new(vec![
                    analyze_response(),
                    recommend_response(),
                ])),
                Arc::new(ToolRegistry::with_builtin_tools()),
                fast_retry(),
            )
        };
        let a = make_engine();
        let b = make_engine();

        let (first, second) = tokio::join!(
            a.start(42, documents(), vec![]),
            b.start(42, documents(), vec![]),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(
            |r| matches!(r, Err(EngineError::Conflict { experiment_id: 42 }))
        ));
    }

    #[tokio::test]
    async fn terminal_run_frees_the_experiment_for_a_new_run() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();
        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(ScriptedModel::new(vec![
                analyze_response(),
                recommend_response(),
                analyze_response(),
                recommend_response(),
            ])),
            Arc::new(ToolRegistry::with_builtin_tools()),
            fast_retry(),
        );

        let first = engine.start(42, documents(), vec![]).await.unwrap();
        engine.cancel(first).unwrap();
        assert_eq!(engine.status(first).unwrap().status, RunStatus::Cancelled);

        engine.start(42, documents(), vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_during_recommend_cancels_instead_of_suspending() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();
        // One permit: Analyze proceeds, Recommend parks on the gate.
        let gate = Arc::new(tokio::sync::Semaphore::new(1));
        let engine = Arc::new(WorkflowEngine::new(
            store,
            Arc::new(GatedModel::new(
                vec![analyze_response(), recommend_response()],
                gate.clone(),
            )),
            Arc::new(ToolRegistry::with_builtin_tools()),
            fast_retry(),
        ));

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start(1, documents(), vec![]).await }
        });

        let run_id = wait_for_run(&engine, 1, RunStatus::Recommending).await;
        engine.cancel(run_id).unwrap();
        gate.add_permits(1);

        task.await.unwrap().unwrap();
        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        // The in-flight recommendation is discarded, not suspended for review.
        assert!(snapshot.outputs.recommended_strategy.is_none());
    }

    #[tokio::test]
    async fn cancel_during_synthesize_discards_the_synthesis() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();
        // Two permits cover Analyze and Recommend; Synthesize parks.
        let gate = Arc::new(tokio::sync::Semaphore::new(2));
        let engine = Arc::new(WorkflowEngine::new(
            store,
            Arc::new(GatedModel::new(
                vec![
                    analyze_response(),
                    recommend_response(),
                    synthesize_response(),
                ],
                gate.clone(),
            )),
            Arc::new(ToolRegistry::with_builtin_tools()),
            fast_retry(),
        ));

        let run_id = engine.start(1, documents(), vec![]).await.unwrap();
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.resume(run_id, true, None, None).await }
        });

        wait_until(&engine, run_id, RunStatus::Synthesizing).await;
        engine.cancel(run_id).unwrap();
        gate.add_permits(1);

        task.await.unwrap().unwrap();
        let snapshot = engine.status(run_id).unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert!(snapshot.outputs.cross_document_insights.is_none());
        // Execute finished before the cancel; its committed results stay.
        assert!(snapshot.outputs.processing_results.is_some());
    }

    #[tokio::test]
    async fn concurrent_resumes_admit_exactly_one() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        store.initialize_schema().unwrap();

        let make_engine = |responses| {
            WorkflowEngine::new(
                store.clone(),
                Arc::new(ScriptedModel::new(responses)),
                Arc::new(ToolRegistry::with_builtin_tools()),
                fast_retry(),
            )
        };
        let a = make_engine(vec![
            analyze_response(),
            recommend_response(),
            synthesize_response(),
        ]);
        let b = make_engine(vec![synthesize_response()]);

        let run_id = a.start(42, documents(), vec![]).await.unwrap();
        let (first, second) = tokio::join!(
            a.resume(run_id, true, None, None),
            b.resume(run_id, true, None, None),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(EngineError::InvalidState { .. }))));

        // Exactly one Execute/Synthesize chain in the append-only graph.
        let graph = a.export_provenance(run_id).unwrap();
        for stage in ["execute", "synthesize"] {
            assert_eq!(
                graph
                    .nodes
                    .iter()
                    .filter(|n| n.kind == "activity" && n.label == stage)
                    .count(),
                1,
                "duplicate {stage} activity"
            );
        }
    }

    #[tokio::test]
    async fn cancelled_run_rejects_resume() {
        let engine = engine_with(vec![analyze_response(), recommend_response()]);
        let run_id = engine.start(1, documents(), vec![]).await.unwrap();

        engine.cancel(run_id).unwrap();
        let err = engine.resume(run_id, true, None, None).await.unwrap_err();
        // The message names the actual state without presuming what the
        // caller expected.
        assert!(err.to_string().contains("cancelled"));
        assert!(!err.to_string().contains("awaiting_review"));
        assert!(matches!(
            err,
            EngineError::InvalidState {
                status: RunStatus::Cancelled,
                ..
            }
        ));

        // Terminal runs cannot be cancelled again either.
        assert!(matches!(
            engine.cancel(run_id),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_modified_strategy_is_rejected_without_side_effects() {
        let engine = engine_with(vec![analyze_response(), recommend_response()]);
        let run_id = engine.start(1, documents(), vec![]).await.unwrap();

        let mut bad_tool = Strategy::new();
        bad_tool.insert("7".to_string(), vec!["sentiment".to_string()]);
        let err = engine
            .resume(run_id, true, Some(bad_tool), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTool(name) if name == "sentiment"));

        let mut bad_doc = Strategy::new();
        bad_doc.insert("999".to_string(), vec!["term_frequency".to_string()]);
        let err = engine
            .resume(run_id, true, Some(bad_doc), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDocument(id) if id == "999"));

        // Still suspended; a valid decision works afterwards.
        assert_eq!(
            engine.status(run_id).unwrap().status,
            RunStatus::AwaitingReview
        );
    }

    #[tokio::test]
    async fn start_rejects_unknown_available_tools() {
        let engine = engine_with(vec![]);
        let err = engine
            .start(1, documents(), vec!["sentiment".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTool(name) if name == "sentiment"));
        assert!(engine.list(Some(1), None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_is_idempotent() {
        let engine = engine_with(vec![analyze_response(), recommend_response()]);
        let run_id = engine.start(1, documents(), vec![]).await.unwrap();

        let first = engine.status(run_id).unwrap();
        let second = engine.status(run_id).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn status_of_unknown_run_is_not_found() {
        let engine = engine_with(vec![]);
        assert!(matches!(
            engine.status(Uuid::new_v4()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn provenance_covers_every_stage_with_generation_edges() {
        let engine = engine_with(vec![
            analyze_response(),
            recommend_response(),
            synthesize_response(),
        ]);
        let run_id = engine.start(42, documents(), vec![]).await.unwrap();
        engine.resume(run_id, true, None, None).await.unwrap();

        let graph = engine.export_provenance(run_id).unwrap();

        let entity_labels: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| n.kind == "entity")
            .map(|n| n.label.as_str())
            .collect();
        for label in [
            "input_documents",
            "analyze_output",
            "recommend_output",
            "review_output",
            "execute_output",
            "synthesize_output",
        ] {
            assert!(entity_labels.contains(&label), "missing {label}");
        }

        // Every entity was generated by a recorded activity.
        for node in graph.nodes.iter().filter(|n| n.kind == "entity") {
            let generated = graph
                .edges
                .iter()
                .find(|e| e.subject == node.id && e.predicate == "wasGeneratedBy")
                .unwrap_or_else(|| panic!("{} has no generation edge", node.label));
            assert!(graph
                .nodes
                .iter()
                .any(|n| n.kind == "activity" && n.id == generated.object));
        }

        // Every stage output after ingest derives from its predecessor, so
        // the derivation chain is unbroken from documents to synthesis.
        for node in graph
            .nodes
            .iter()
            .filter(|n| n.kind == "entity" && n.label != "input_documents")
        {
            assert!(
                graph
                    .edges
                    .iter()
                    .any(|e| e.subject == node.id && e.predicate == "wasDerivedFrom"),
                "{} has no derivation edge",
                node.label
            );
        }
        assert!(graph.edges.iter().any(|e| e.predicate == "used"));
        assert!(graph
            .edges
            .iter()
            .any(|e| e.predicate == "wasAssociatedWith"));
    }
}

//! Append-only provenance graph.
//!
//! Three node kinds: agents (the engine, a tool, a reviewer), activities
//! (one stage execution), and entities (immutable stage outputs). Edges are
//! stored as relation rows. Every entity carries a mandatory `generated_by`
//! activity, enforced at insert time, so the graph can never contain an
//! orphaned output.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::database::{Database, StoreError};

pub const WAS_GENERATED_BY: &str = "wasGeneratedBy";
pub const WAS_ASSOCIATED_WITH: &str = "wasAssociatedWith";
pub const USED: &str = "used";
pub const WAS_DERIVED_FROM: &str = "wasDerivedFrom";

/// One stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub stage: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One immutable stage output.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub label: String,
    pub value: serde_json::Value,
    pub generated_by: Uuid,
}

/// One edge of the graph.
#[derive(Debug, Clone, Serialize)]
pub struct RelationRecord {
    pub run_id: Uuid,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: &'static str,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct GraphEdge {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Node-link export of one run's provenance.
#[derive(Debug, Serialize)]
pub struct ProvenanceGraph {
    pub run_id: Uuid,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Records and exports provenance through the shared store.
pub struct ProvenanceRecorder {
    store: Arc<Database>,
}

impl ProvenanceRecorder {
    pub fn new(store: Arc<Database>) -> Self {
        Self { store }
    }

    /// Record a completed stage execution and its association with the agent
    /// that performed it. Returns the activity ID for `generated_by` links.
    pub fn record_activity(
        &self,
        run_id: Uuid,
        stage: &str,
        agent: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let activity = ActivityRecord {
            id: Uuid::new_v4(),
            run_id,
            stage: stage.to_string(),
            agent: agent.to_string(),
            started_at,
            ended_at,
        };
        self.store.insert_activity(&activity)?;
        self.store.insert_relation(&RelationRecord {
            run_id,
            subject: activity.id.to_string(),
            predicate: WAS_ASSOCIATED_WITH.to_string(),
            object: format!("agent:{agent}"),
            recorded_at: Utc::now(),
        })?;
        Ok(activity.id)
    }

    /// Record a stage output. The generating activity must already exist;
    /// an optional `derived_from` links this entity to its predecessor.
    pub fn record_entity(
        &self,
        run_id: Uuid,
        label: &str,
        value: serde_json::Value,
        generated_by: Uuid,
        derived_from: Option<Uuid>,
    ) -> Result<Uuid, StoreError> {
        let entity = EntityRecord {
            id: Uuid::new_v4(),
            run_id,
            label: label.to_string(),
            value,
            generated_by,
        };
        self.store.insert_entity(&entity)?;
        self.store.insert_relation(&RelationRecord {
            run_id,
            subject: entity.id.to_string(),
            predicate: WAS_GENERATED_BY.to_string(),
            object: generated_by.to_string(),
            recorded_at: Utc::now(),
        })?;
        if let Some(source) = derived_from {
            self.store.insert_relation(&RelationRecord {
                run_id,
                subject: entity.id.to_string(),
                predicate: WAS_DERIVED_FROM.to_string(),
                object: source.to_string(),
                recorded_at: Utc::now(),
            })?;
        }
        Ok(entity.id)
    }

    /// Record an arbitrary edge, e.g. a `used` link from an activity to the
    /// entity it consumed.
    pub fn record_relationship(
        &self,
        run_id: Uuid,
        subject: &str,
        predicate: &str,
        object: &str,
    ) -> Result<(), StoreError> {
        self.store.insert_relation(&RelationRecord {
            run_id,
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object: object.to_string(),
            recorded_at: Utc::now(),
        })
    }

    /// Most recent entity recorded for a run, for chaining derivation edges
    /// across a suspend/resume boundary.
    pub fn latest_entity(&self, run_id: &Uuid) -> Result<Option<Uuid>, StoreError> {
        self.store.latest_entity_id(run_id)
    }

    /// Export the run's provenance as a node-link graph.
    pub fn export(&self, run_id: &Uuid) -> Result<ProvenanceGraph, StoreError> {
        let (activities, entities, relations) = self.store.provenance_for_run(run_id)?;

        let mut nodes: Vec<GraphNode> = Vec::new();

        let agents: BTreeSet<String> =
            activities.iter().map(|a| a.agent.clone()).collect();
        for agent in agents {
            nodes.push(GraphNode {
                id: format!("agent:{agent}"),
                kind: "agent",
                label: agent,
                data: None,
            });
        }

        for activity in &activities {
            nodes.push(GraphNode {
                id: activity.id.to_string(),
                kind: "activity",
                label: activity.stage.clone(),
                data: Some(serde_json::json!({
                    "agent": activity.agent,
                    "started_at": activity.started_at,
                    "ended_at": activity.ended_at,
                })),
            });
        }

        for entity in &entities {
            nodes.push(GraphNode {
                id: entity.id.to_string(),
                kind: "entity",
                label: entity.label.clone(),
                data: Some(entity.value.clone()),
            });
        }

        let edges = relations
            .into_iter()
            .map(|r| GraphEdge {
                subject: r.subject,
                predicate: r.predicate,
                object: r.object,
            })
            .collect();

        Ok(ProvenanceGraph {
            run_id: *run_id,
            nodes,
            edges,
        })
    }
}

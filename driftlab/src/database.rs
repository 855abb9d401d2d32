//! SQLite persistence for workflow runs and the provenance graph.
//!
//! One row per run with the stage outputs as a JSON column, queryable by run
//! ID and by (experiment_id, status). The "one active run per experiment"
//! invariant is enforced here with a partial unique index over non-terminal
//! statuses, so concurrent `start` calls race safely: exactly one insert
//! succeeds and the loser gets a typed `ActiveRunExists`.
//!
//! Provenance rows live in the same database and are append-only: this
//! module exposes inserts and reads for them, never updates or deletes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{RunStatus, Stage, WorkflowRun};
use crate::provenance::{ActivityRecord, EntityRecord, RelationRecord};

/// Storage-level errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("an active run already exists for experiment {experiment_id}")]
    ActiveRunExists { experiment_id: i64 },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("activity {0} is not recorded; every entity must be generated by a recorded activity")]
    MissingActivity(Uuid),

    #[error("corrupt {kind} value in database: {value}")]
    Corrupt { kind: &'static str, value: String },
}

/// Database wrapper for run and provenance persistence.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for better concurrent access
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create all tables and indexes.
    pub fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                experiment_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_stage TEXT,

                documents TEXT NOT NULL,
                available_tools TEXT NOT NULL,
                outputs TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,

                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_active_experiment
                ON runs(experiment_id)
                WHERE status NOT IN ('completed', 'failed', 'cancelled');

            CREATE INDEX IF NOT EXISTS idx_runs_experiment ON runs(experiment_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

            CREATE TABLE IF NOT EXISTS prov_activities (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                stage TEXT NOT NULL,
                agent TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS prov_entities (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                label TEXT NOT NULL,
                value TEXT NOT NULL,
                generated_by TEXT NOT NULL REFERENCES prov_activities(id)
            );

            CREATE TABLE IF NOT EXISTS prov_relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id),
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_prov_activities_run ON prov_activities(run_id);
            CREATE INDEX IF NOT EXISTS idx_prov_entities_run ON prov_entities(run_id);
            CREATE INDEX IF NOT EXISTS idx_prov_relations_run ON prov_relations(run_id);
            "#,
        )?;

        Ok(())
    }

    /// Insert a new run. Fails with `ActiveRunExists` when a non-terminal run
    /// for the same experiment is already present.
    pub fn insert_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            r#"
            INSERT INTO runs (
                id, experiment_id, status, current_stage,
                documents, available_tools, outputs, error, cancel_requested,
                created_at, started_at, completed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                run.id.to_string(),
                run.experiment_id,
                run.status.as_str(),
                run.current_stage.map(|s| s.as_str()),
                serde_json::to_string(&run.documents)?,
                serde_json::to_string(&run.available_tools)?,
                serde_json::to_string(&run.outputs)?,
                run.error,
                run.cancel_requested as i64,
                run.created_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::ActiveRunExists {
                    experiment_id: run.experiment_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the mutable parts of a run (status, stage, outputs, error,
    /// timestamps) in a single statement.
    pub fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE runs
            SET status = ?2,
                current_stage = ?3,
                outputs = ?4,
                error = ?5,
                started_at = ?6,
                completed_at = ?7,
                updated_at = ?8
            WHERE id = ?1
            "#,
            params![
                run.id.to_string(),
                run.status.as_str(),
                run.current_stage.map(|s| s.as_str()),
                serde_json::to_string(&run.outputs)?,
                run.error,
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::RunNotFound(run.id));
        }
        Ok(())
    }

    pub fn get_run(&self, id: &Uuid) -> Result<WorkflowRun, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                r#"
                SELECT id, experiment_id, status, current_stage,
                       documents, available_tools, outputs, error, cancel_requested,
                       created_at, started_at, completed_at, updated_at
                FROM runs WHERE id = ?1
                "#,
                params![id.to_string()],
                RawRun::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => raw.into_run(),
            None => Err(StoreError::RunNotFound(*id)),
        }
    }

    /// List runs, optionally filtered by experiment and/or status, newest
    /// first.
    pub fn list_runs(
        &self,
        experiment_id: Option<i64>,
        status: Option<RunStatus>,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, experiment_id, status, current_stage,
                   documents, available_tools, outputs, error, cancel_requested,
                   created_at, started_at, completed_at, updated_at
            FROM runs
            WHERE (?1 IS NULL OR experiment_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC
            "#,
        )?;

        let raws = stmt
            .query_map(
                params![experiment_id, status.map(|s| s.as_str())],
                RawRun::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(RawRun::into_run).collect()
    }

    /// Atomically move a run from one status to another. Returns false when
    /// the run is no longer in `from`, so concurrent callers racing over the
    /// same transition admit exactly one winner.
    pub fn transition_status(
        &self,
        id: &Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE runs SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![
                id.to_string(),
                from.as_str(),
                to.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Set the cooperative cancellation flag.
    pub fn request_cancel(&self, id: &Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE runs SET cancel_requested = 1, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(*id));
        }
        Ok(())
    }

    pub fn cancel_requested(&self, id: &Uuid) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match flag {
            Some(value) => Ok(value != 0),
            None => Err(StoreError::RunNotFound(*id)),
        }
    }

    // ------------------------------------------------------------------
    // Provenance (append-only)
    // ------------------------------------------------------------------

    pub fn insert_activity(&self, activity: &ActivityRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO prov_activities (id, run_id, stage, agent, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                activity.id.to_string(),
                activity.run_id.to_string(),
                activity.stage,
                activity.agent,
                activity.started_at.to_rfc3339(),
                activity.ended_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert an entity. The `generated_by` activity must already be
    /// recorded; provenance completeness is enforced, not a convention.
    pub fn insert_entity(&self, entity: &EntityRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM prov_activities WHERE id = ?1)",
            params![entity.generated_by.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::MissingActivity(entity.generated_by));
        }

        conn.execute(
            r#"
            INSERT INTO prov_entities (id, run_id, label, value, generated_by)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entity.id.to_string(),
                entity.run_id.to_string(),
                entity.label,
                serde_json::to_string(&entity.value)?,
                entity.generated_by.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_relation(&self, relation: &RelationRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO prov_relations (run_id, subject, predicate, object, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                relation.run_id.to_string(),
                relation.subject,
                relation.predicate,
                relation.object,
                relation.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recently recorded entity for a run, if any. Used to chain
    /// `wasDerivedFrom` edges across a suspend/resume boundary.
    pub fn latest_entity_id(&self, run_id: &Uuid) -> Result<Option<Uuid>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM prov_entities WHERE run_id = ?1 ORDER BY rowid DESC LIMIT 1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|s| parse_uuid(&s)).transpose()
    }

    /// All provenance rows for a run, in recording order.
    #[allow(clippy::type_complexity)]
    pub fn provenance_for_run(
        &self,
        run_id: &Uuid,
    ) -> Result<(Vec<ActivityRecord>, Vec<EntityRecord>, Vec<RelationRecord>), StoreError> {
        let conn = self.conn.lock().unwrap();
        let run_key = run_id.to_string();

        let mut stmt = conn.prepare(
            "SELECT id, stage, agent, started_at, ended_at
             FROM prov_activities WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let activities = stmt
            .query_map(params![run_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, stage, agent, started, ended)| {
                Ok(ActivityRecord {
                    id: parse_uuid(&id)?,
                    run_id: *run_id,
                    stage,
                    agent,
                    started_at: parse_timestamp(&started)?,
                    ended_at: parse_timestamp(&ended)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, label, value, generated_by
             FROM prov_entities WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let entities = stmt
            .query_map(params![run_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, label, value, generated_by)| {
                Ok(EntityRecord {
                    id: parse_uuid(&id)?,
                    run_id: *run_id,
                    label,
                    value: serde_json::from_str(&value)?,
                    generated_by: parse_uuid(&generated_by)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut stmt = conn.prepare(
            "SELECT subject, predicate, object, recorded_at
             FROM prov_relations WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let relations = stmt
            .query_map(params![run_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(subject, predicate, object, recorded_at)| {
                Ok(RelationRecord {
                    run_id: *run_id,
                    subject,
                    predicate,
                    object,
                    recorded_at: parse_timestamp(&recorded_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok((activities, entities, relations))
    }
}

/// Row as read from SQLite, before JSON columns are parsed.
struct RawRun {
    id: String,
    experiment_id: i64,
    status: String,
    current_stage: Option<String>,
    documents: String,
    available_tools: String,
    outputs: String,
    error: Option<String>,
    cancel_requested: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl RawRun {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            experiment_id: row.get(1)?,
            status: row.get(2)?,
            current_stage: row.get(3)?,
            documents: row.get(4)?,
            available_tools: row.get(5)?,
            outputs: row.get(6)?,
            error: row.get(7)?,
            cancel_requested: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, StoreError> {
        let status = RunStatus::parse(&self.status).ok_or(StoreError::Corrupt {
            kind: "status",
            value: self.status.clone(),
        })?;
        let current_stage = match &self.current_stage {
            Some(raw) => Some(Stage::parse(raw).ok_or(StoreError::Corrupt {
                kind: "stage",
                value: raw.clone(),
            })?),
            None => None,
        };

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            experiment_id: self.experiment_id,
            status,
            current_stage,
            documents: serde_json::from_str(&self.documents)?,
            available_tools: serde_json::from_str(&self.available_tools)?,
            outputs: serde_json::from_str(&self.outputs)?,
            error: self.error,
            cancel_requested: self.cancel_requested != 0,
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::Corrupt {
        kind: "uuid",
        value: value.to_string(),
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            kind: "timestamp",
            value: value.to_string(),
        })
}

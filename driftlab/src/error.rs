//! Engine-level error taxonomy.

use crate::database::StoreError;
use crate::models::RunStatus;
use uuid::Uuid;

/// Errors surfaced to engine callers. All of these are rejected without side
/// effects; failures that happen inside a running stage are captured on the
/// run record instead (status `failed` plus a human-readable reason).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("an active run already exists for experiment {experiment_id}")]
    Conflict { experiment_id: i64 },

    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("run {run_id} is {status}; the operation is not valid in that state")]
    InvalidState { run_id: Uuid, status: RunStatus },

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("strategy names document '{0}' which is not part of this run")]
    UnknownDocument(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

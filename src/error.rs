use thiserror::Error;

use crate::storage::{LockError, PersistenceError};
use crate::workflows::{SchemaError, WorkflowStatus};

/// Errors surfaced by [`crate::WorkflowEngine`] operations.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Workflow instance {instance_id} not found")]
    NotFound { instance_id: String },

    #[error("Schema validation failed: {0}")]
    Validation(#[from] SchemaError),

    #[error("Schema for workflow '{workflow}' could not be resolved: {source}")]
    SchemaUnavailable {
        workflow: String,
        #[source]
        source: SchemaError,
    },

    #[error("Instance {instance_id} cannot transition while {status}")]
    InvalidTransition {
        instance_id: String,
        status: WorkflowStatus,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

impl FlowError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FlowError::NotFound { .. })
    }
}

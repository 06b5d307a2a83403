use thiserror::Error;

use crate::types::{ExecutionMode, Status};

#[derive(Debug, Error)]
pub enum PlexusError {
    // Engine defects / configuration errors (never retried)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No strategy registered for execution mode {0:?}")]
    UnknownExecutionMode(ExecutionMode),

    #[error("Resume is not supported for execution mode {0:?}")]
    ResumeUnsupported(ExecutionMode),

    #[error("Illegal status transition for {node_execution_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        node_execution_id: String,
        from: Status,
        to: Status,
    },

    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(String),

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(String),

    #[error("Plan node not found: {0}")]
    PlanNodeNotFound(String),

    #[error("No step registered for step type: {0}")]
    StepNotRegistered(String),

    // Optimistic concurrency
    #[error("Version conflict on {id}: expected version {expected}")]
    VersionConflict { id: String, expected: u64 },

    #[error("Update of {id} gave up after {attempts} attempts")]
    ConcurrentUpdateExhausted { id: String, attempts: u32 },

    #[error("Node execution already exists: {0}")]
    DuplicateNodeExecution(String),

    // Outcomes
    #[error("Outcome already published: {name} at {scope_runtime_id} in {plan_execution_id}")]
    DuplicateOutcome {
        plan_execution_id: String,
        scope_runtime_id: String,
        name: String,
    },

    #[error("Outcome not found: {0}")]
    OutcomeNotFound(String),

    // Remote dispatch
    #[error("Task dispatch failed: {0}")]
    TaskDispatch(String),

    // Locks
    #[error("Lock is held: {0}")]
    LockHeld(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlexusError {
    /// Infrastructure failures that are retried locally and never surface as
    /// a business failure of the node.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlexusError::VersionConflict { .. }
                | PlexusError::TaskDispatch(_)
                | PlexusError::LockHeld(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlexusError>;

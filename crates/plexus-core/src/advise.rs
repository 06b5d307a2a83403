use serde::{Deserialize, Serialize};

use crate::types::Status;

/// Action to take once a node has produced a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advise {
    /// Proceed to a sibling, or finish the current branch when `next_node_id` is empty.
    NextStep {
        next_node_id: Option<String>,
        to_status: Option<Status>,
    },
    /// Re-run the node as a fresh execution after `wait_interval_ms`.
    Retry {
        node_execution_id: String,
        wait_interval_ms: u64,
    },
    /// Pause for a human decision; `timeout_action` applies if nobody acts.
    InterventionWait {
        timeout_ms: u64,
        timeout_action: RepairActionCode,
    },
    Abort,
    Ignore {
        next_node_id: Option<String>,
    },
    MarkSuccess {
        next_node_id: Option<String>,
    },
    EndPlan {
        to_status: Status,
    },
}

impl Advise {
    pub fn kind(&self) -> &'static str {
        match self {
            Advise::NextStep { .. } => "next_step",
            Advise::Retry { .. } => "retry",
            Advise::InterventionWait { .. } => "intervention_wait",
            Advise::Abort => "abort",
            Advise::Ignore { .. } => "ignore",
            Advise::MarkSuccess { .. } => "mark_success",
            Advise::EndPlan { .. } => "end_plan",
        }
    }
}

/// Follow-up action configured on a failure strategy.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionCode {
    ManualIntervention,
    RollbackWorkflow,
    RollbackPhase,
    EndExecution,
    AbortWorkflowExecution,
    Ignore,
    MarkAsSuccess,
    Retry,
    StageRollback,
    Unknown,
}

impl RepairActionCode {
    /// Actions the engine escalates to a parent or a human instead of an adviser deciding.
    pub fn is_escalation(self) -> bool {
        matches!(
            self,
            RepairActionCode::ManualIntervention
                | RepairActionCode::RollbackWorkflow
                | RepairActionCode::RollbackPhase
                | RepairActionCode::EndExecution
                | RepairActionCode::AbortWorkflowExecution
        )
    }
}

/// A human decision on a node paused in intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionAction {
    Retry,
    MarkAsSuccess,
    Ignore,
    Abort,
    MarkAsFailure,
}

impl From<RepairActionCode> for InterventionAction {
    fn from(code: RepairActionCode) -> Self {
        match code {
            RepairActionCode::Retry => InterventionAction::Retry,
            RepairActionCode::MarkAsSuccess => InterventionAction::MarkAsSuccess,
            RepairActionCode::Ignore => InterventionAction::Ignore,
            RepairActionCode::EndExecution => InterventionAction::MarkAsFailure,
            _ => InterventionAction::Abort,
        }
    }
}

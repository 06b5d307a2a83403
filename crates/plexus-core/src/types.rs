use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh execution-scoped identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle status of a node execution.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    InterventionWaiting,
    ApprovalWaiting,
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    TimedOut,
    Expired,
    Skipped,
    IgnoreFailed,
}

impl Status {
    pub const ALL: [Status; 15] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::InterventionWaiting,
        Status::ApprovalWaiting,
        Status::Discontinuing,
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Aborted,
        Status::TimedOut,
        Status::Expired,
        Status::Skipped,
        Status::IgnoreFailed,
    ];

    /// Terminal statuses. A node in one of these never runs again; retries
    /// create a new node execution instead.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Errored
                | Status::Aborted
                | Status::TimedOut
                | Status::Expired
                | Status::Skipped
                | Status::IgnoreFailed
        )
    }

    /// Terminal statuses that count as a failure when aggregated into a parent.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Errored | Status::Expired | Status::TimedOut
        )
    }

    /// Suspended waiting on something outside the engine.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::InterventionWaiting
                | Status::ApprovalWaiting
        )
    }

    /// Actively progressing (holding or awaiting engine work).
    pub fn is_flowing(self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::Running
                | Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::Discontinuing
        )
    }

    /// Statuses the retry adviser reacts to.
    pub fn retryable() -> &'static [Status] {
        &[
            Status::Failed,
            Status::Errored,
            Status::Expired,
            Status::Aborted,
            Status::TimedOut,
        ]
    }

    pub fn is_retryable(self) -> bool {
        Self::retryable().contains(&self)
    }

    /// The node execution status machine.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match self {
            Queued => matches!(next, Running | Discontinuing | Aborted | Skipped | Expired),
            Running => next != Queued && next != Running,
            AsyncWaiting | TaskWaiting | ApprovalWaiting => {
                next == Running || next == Discontinuing || next.is_final()
            }
            InterventionWaiting => matches!(
                next,
                Running | Discontinuing | Succeeded | Aborted | Failed | Expired | IgnoreFailed
            ),
            Discontinuing => matches!(next, Aborted | Expired | Errored),
            Failed | Errored | Expired | TimedOut | Aborted => {
                matches!(next, InterventionWaiting | IgnoreFailed | Succeeded)
            }
            Succeeded | Skipped | IgnoreFailed => false,
        }
    }
}

/// How a plan node is invoked.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Child,
    Children,
    ChildChain,
    Task,
    TaskV2,
    TaskChain,
    TaskChainV2,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 9] = [
        ExecutionMode::Sync,
        ExecutionMode::Async,
        ExecutionMode::Child,
        ExecutionMode::Children,
        ExecutionMode::ChildChain,
        ExecutionMode::Task,
        ExecutionMode::TaskV2,
        ExecutionMode::TaskChain,
        ExecutionMode::TaskChainV2,
    ];

    pub fn is_chain(self) -> bool {
        matches!(
            self,
            ExecutionMode::ChildChain | ExecutionMode::TaskChain | ExecutionMode::TaskChainV2
        )
    }

    pub fn is_task(self) -> bool {
        matches!(
            self,
            ExecutionMode::Task
                | ExecutionMode::TaskV2
                | ExecutionMode::TaskChain
                | ExecutionMode::TaskChainV2
        )
    }

    pub fn spawns_children(self) -> bool {
        matches!(
            self,
            ExecutionMode::Child | ExecutionMode::Children | ExecutionMode::ChildChain
        )
    }
}

/// Classification of a step failure, used by advisers to pick a policy.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    UnknownFailure,
    ApplicationError,
    TimeoutError,
    ConnectivityError,
    AuthenticationError,
    AuthorizationError,
    VerificationError,
    DelegateProvisioningError,
    PolicyEvaluationFailure,
    InputTimeoutError,
    ApprovalRejection,
    DelegateRestart,
    UserMarkedFailure,
}

/// One lower-level failure reported by a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureData {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
}

/// Failure description attached to a node execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    #[serde(default)]
    pub failure_data: Vec<FailureData>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            error_message: message.into(),
            failure_types: BTreeSet::from([failure_type]),
            failure_data: vec![],
        }
    }

    /// Failure without a classification.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            ..Default::default()
        }
    }

    /// All failure types, including those of nested failure data.
    /// Falls back to `UnknownFailure` when nothing was classified.
    pub fn effective_failure_types(&self) -> BTreeSet<FailureType> {
        let mut types = self.failure_types.clone();
        for data in &self.failure_data {
            types.extend(data.failure_types.iter().copied());
        }
        if types.is_empty() {
            types.insert(FailureType::UnknownFailure);
        }
        types
    }

    /// Merge several failures (e.g. from children) into one.
    pub fn merge<'a>(infos: impl IntoIterator<Item = &'a FailureInfo>) -> FailureInfo {
        let mut merged = FailureInfo::default();
        let mut messages = Vec::new();
        for info in infos {
            if !info.error_message.is_empty() {
                messages.push(info.error_message.clone());
            }
            merged.failure_types.extend(info.failure_types.iter().copied());
            merged.failure_data.extend(info.failure_data.iter().cloned());
        }
        merged.error_message = messages.join("; ");
        merged
    }
}

/// Broad category of a step, used to interpret execution context levels.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stages,
    Stage,
    StepGroup,
    #[default]
    Step,
    Strategy,
    Fork,
}

#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepType {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub category: StepCategory,
}

impl StepType {
    pub fn new(type_name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            type_name: type_name.into(),
            category,
        }
    }

    pub fn step(type_name: impl Into<String>) -> Self {
        Self::new(type_name, StepCategory::Step)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name)
    }
}

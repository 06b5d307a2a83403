use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::advise::Advise;
use crate::ambiance::Ambiance;
use crate::error::{PlexusError, Result};
use crate::plan::PlanNode;
use crate::step::{TaskProtocol, TaskRequest};
use crate::types::{ExecutionMode, FailureInfo, Status, StepType};

/// Per-mode continuation state recorded when a strategy suspends a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    Async {
        callback_ids: Vec<String>,
    },
    Child {
        child_node_id: String,
    },
    Children {
        child_node_ids: Vec<String>,
    },
    ChildChain {
        next_child_id: Option<String>,
        callback_id: Option<String>,
        #[serde(default)]
        pass_through: Option<serde_json::Value>,
        last_link: bool,
        suspend: bool,
    },
    Task {
        task_id: String,
        protocol: TaskProtocol,
    },
    TaskChain {
        /// Dispatched task; `None` while suspended ahead of dispatch.
        task_id: Option<String>,
        /// Task to dispatch once a suspended link is resumed.
        #[serde(default)]
        pending_task: Option<TaskRequest>,
        callback_id: Option<String>,
        protocol: TaskProtocol,
        #[serde(default)]
        pass_through: Option<serde_json::Value>,
        chain_end: bool,
        suspend: bool,
    },
}

impl ExecutableResponse {
    /// Suspend flag of a chain link; `None` for non-chain responses.
    pub fn suspend(&self) -> Option<bool> {
        match self {
            ExecutableResponse::ChildChain { suspend, .. }
            | ExecutableResponse::TaskChain { suspend, .. } => Some(*suspend),
            _ => None,
        }
    }

    pub fn pass_through(&self) -> Option<&serde_json::Value> {
        match self {
            ExecutableResponse::ChildChain { pass_through, .. }
            | ExecutableResponse::TaskChain { pass_through, .. } => pass_through.as_ref(),
            _ => None,
        }
    }
}

/// One attempt at running a plan node. Never deleted; superseded attempts
/// are flagged `old_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: String,
    pub plan_execution_id: String,
    pub node_id: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub ambiance: Ambiance,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub next_id: Option<String>,
    /// Correlation id the parent waits on.
    #[serde(default)]
    pub notify_id: Option<String>,
    pub status: Status,
    pub step_type: StepType,
    pub mode: ExecutionMode,
    /// Superseded attempts, most recent first.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub adviser_response: Option<Advise>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    /// Storage keys of outcomes this node published.
    #[serde(default)]
    pub outcome_refs: Vec<String>,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl NodeExecution {
    /// Fresh queued execution of `node` under `ambiance`, whose current
    /// level must already carry `uuid` as its runtime id.
    pub fn new(uuid: impl Into<String>, node: &PlanNode, ambiance: Ambiance) -> Self {
        let now = Utc::now();
        Self {
            uuid: uuid.into(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            node_id: node.uuid.clone(),
            identifier: node.identifier.clone(),
            name: node.name.clone(),
            ambiance,
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: None,
            status: Status::Queued,
            step_type: node.step_type.clone(),
            mode: node.mode,
            retry_ids: vec![],
            old_retry: false,
            executable_responses: vec![],
            adviser_response: None,
            failure_info: None,
            outcome_refs: vec![],
            start_ts: None,
            end_ts: None,
            created_at: now,
            last_updated_at: now,
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn with_notify_id(mut self, notify_id: Option<String>) -> Self {
        self.notify_id = notify_id;
        self
    }

    /// Move to `to`, enforcing the status machine.
    pub fn transition(&mut self, to: Status) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PlexusError::IllegalTransition {
                node_execution_id: self.uuid.clone(),
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if to == Status::Running && self.start_ts.is_none() {
            self.start_ts = Some(now);
        }
        if to.is_final() {
            self.end_ts = Some(now);
        }
        self.status = to;
        Ok(())
    }

    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    pub fn last_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// Copy for the next attempt: run state is reset, lineage is extended
    /// and the parent/sibling links are kept.
    pub fn prepare_retry(&self, new_uuid: impl Into<String>, ambiance: Ambiance) -> NodeExecution {
        let now = Utc::now();
        let mut retry_ids = Vec::with_capacity(self.retry_ids.len() + 1);
        retry_ids.push(self.uuid.clone());
        retry_ids.extend(self.retry_ids.iter().cloned());

        NodeExecution {
            uuid: new_uuid.into(),
            ambiance,
            status: Status::Queued,
            retry_ids,
            old_retry: false,
            next_id: None,
            executable_responses: vec![],
            adviser_response: None,
            failure_info: None,
            outcome_refs: vec![],
            start_ts: None,
            end_ts: None,
            created_at: now,
            last_updated_at: now,
            version: 0,
            ..self.clone()
        }
    }
}

/// Top-level run of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan_id: String,
    pub status: Status,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl PlanExecution {
    pub fn new(uuid: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            plan_id: plan_id.into(),
            status: Status::Running,
            start_ts: Utc::now(),
            end_ts: None,
            version: 0,
        }
    }

    pub fn finish(&mut self, status: Status) {
        self.status = status;
        self.end_ts = Some(Utc::now());
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::advise::Advise;
use crate::ambiance::{Ambiance, StrategyMetadata};
use crate::plan::PlanNode;
use crate::types::{FailureInfo, Status};

/// Everything a step sees when it is started or resumed.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub plan_node: PlanNode,
    /// Step parameters with outcome expressions already rendered.
    pub step_parameters: serde_json::Value,
    /// Data carried from the previous chain link.
    pub pass_through: Option<serde_json::Value>,
}

/// A named value the step wants published as an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub group: Option<String>,
}

/// Terminal result of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: Vec<StepOutcome>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            outcomes: vec![],
        }
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcomes: vec![],
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            failure_info: None,
            outcomes: vec![],
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.outcomes.push(StepOutcome {
            name: name.into(),
            value,
            group: None,
        });
        self
    }

    /// Fold the responses a node was resumed with into a single result.
    /// Any broken response fails the node; otherwise any abort aborts it.
    pub fn from_responses(responses: &ResponseMap) -> StepResponse {
        let mut broken = Vec::new();
        let mut aborted = false;
        for data in responses.values() {
            let (status, failure) = match data {
                ResponseData::Child(n) => (n.status, n.failure_info.as_ref()),
                ResponseData::Task(t) => (t.status, t.failure_info.as_ref()),
                ResponseData::Callback(_) => (Status::Succeeded, None),
            };
            if status.is_broken() {
                broken.push(failure.cloned().unwrap_or_default());
            } else if status == Status::Aborted {
                aborted = true;
            }
        }

        if !broken.is_empty() {
            return StepResponse::failed(FailureInfo::merge(broken.iter()));
        }
        if aborted {
            return StepResponse::with_status(Status::Aborted);
        }
        StepResponse::succeeded()
    }
}

/// Wire protocol a task is dispatched with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskProtocol {
    #[default]
    V1,
    V2,
}

/// A unit of remote work handed to the task dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub protocol: TaskProtocol,
    /// Set by the engine: id of the node execution awaiting the result.
    #[serde(default)]
    pub callback_token: String,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            timeout_ms: None,
            protocol: TaskProtocol::V1,
            callback_token: String::new(),
        }
    }
}

/// Result of a remote task, delivered out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: Status,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

/// Synthesized "child finished" record handed to a resuming parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildNotification {
    pub node_id: String,
    pub identifier: String,
    pub node_execution_id: String,
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcome_refs: Vec<String>,
    /// Values of `outcome_refs`, by outcome name.
    #[serde(default)]
    pub outcomes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub adviser_response: Option<Advise>,
    /// Set when the child's outcomes could not be fetched.
    #[serde(default)]
    pub outcome_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponseData {
    Child(ChildNotification),
    Task(TaskResponse),
    Callback(serde_json::Value),
}

/// Responses a node is resumed with, keyed by child execution id, task id
/// or callback id.
pub type ResponseMap = BTreeMap<String, ResponseData>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutableResponse {
    pub child_node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpawn {
    pub plan_node_id: String,
    #[serde(default)]
    pub strategy_metadata: Option<StrategyMetadata>,
}

impl ChildSpawn {
    pub fn new(plan_node_id: impl Into<String>) -> Self {
        Self {
            plan_node_id: plan_node_id.into(),
            strategy_metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenExecutableResponse {
    pub children: Vec<ChildSpawn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ChainTarget {
    Child(String),
    Task(TaskRequest),
}

/// One link of a child or task chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Work for this link; `None` ends the chain.
    pub target: Option<ChainTarget>,
    #[serde(default)]
    pub pass_through: Option<serde_json::Value>,
    /// Pause on an external callback before running `target`.
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub last_link: bool,
}

impl ChainLink {
    pub fn child(node_id: impl Into<String>) -> Self {
        Self {
            target: Some(ChainTarget::Child(node_id.into())),
            pass_through: None,
            suspend: false,
            last_link: false,
        }
    }

    pub fn task(request: TaskRequest) -> Self {
        Self {
            target: Some(ChainTarget::Task(request)),
            pass_through: None,
            suspend: false,
            last_link: false,
        }
    }

    pub fn end() -> Self {
        Self {
            target: None,
            pass_through: None,
            suspend: false,
            last_link: true,
        }
    }

    pub fn last(mut self) -> Self {
        self.last_link = true;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspend = true;
        self
    }

    pub fn with_pass_through(mut self, data: serde_json::Value) -> Self {
        self.pass_through = Some(data);
        self
    }
}

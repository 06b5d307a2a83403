use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PlexusError, Result};
use crate::types::{ExecutionMode, StepType};

/// Which adviser a plan node consults, with its opaque parameters.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserType {
    Retry,
    OnSuccess,
    OnFail,
    NextStep,
    Ignore,
    Abort,
    MarkSuccess,
    ManualIntervention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub adviser_type: AdviserType,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: AdviserType, parameters: serde_json::Value) -> Self {
        Self {
            adviser_type,
            parameters,
        }
    }
}

/// How a node's vertex is treated in the execution graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipType {
    #[default]
    NoOp,
    SkipNode,
    SkipTree,
}

/// A static node of the plan. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub group: Option<String>,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub step_parameters: serde_json::Value,
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
    #[serde(default)]
    pub skip_graph_type: SkipType,
    #[serde(default)]
    pub skip_expression_chain: bool,
}

impl PlanNode {
    pub fn new(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
        mode: ExecutionMode,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            uuid: uuid.into(),
            name: identifier.clone(),
            identifier,
            step_type,
            group: None,
            mode,
            step_parameters: serde_json::Value::Null,
            advisers: vec![],
            skip_graph_type: SkipType::NoOp,
            skip_expression_chain: false,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_adviser(mut self, adviser_type: AdviserType, parameters: serde_json::Value) -> Self {
        self.advisers.push(AdviserObtainment::new(adviser_type, parameters));
        self
    }

    pub fn with_skip_type(mut self, skip: SkipType) -> Self {
        self.skip_graph_type = skip;
        self
    }
}

/// The planner's output: a pre-validated static graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub uuid: String,
    pub start_node_id: String,
    pub nodes: HashMap<String, PlanNode>,
}

impl Plan {
    pub fn new(uuid: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            start_node_id: start_node_id.into(),
            nodes: HashMap::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.insert(node.uuid.clone(), node);
        self
    }

    pub fn node(&self, id: &str) -> Result<&PlanNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| PlexusError::PlanNodeNotFound(id.to_string()))
    }

    pub fn start_node(&self) -> Result<&PlanNode> {
        self.node(&self.start_node_id)
    }

    /// Read a plan from its JSON form.
    pub fn from_json(content: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural checks the engine relies on: the start node exists and
    /// every node is keyed by its own uuid.
    pub fn validate(&self) -> Result<()> {
        self.start_node()?;
        for (key, node) in &self.nodes {
            if key != &node.uuid {
                return Err(PlexusError::InvalidRequest(format!(
                    "plan node keyed as {key} has uuid {}",
                    node.uuid
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plan_json() {
        let plan = Plan::from_json(
            r#"{
                "uuid": "plan1",
                "start_node_id": "a",
                "nodes": {
                    "a": {
                        "uuid": "a",
                        "identifier": "build",
                        "step_type": {"type": "echo"},
                        "mode": "SYNC",
                        "advisers": [{"type": "ON_SUCCESS", "parameters": {"next_node_id": "b"}}]
                    },
                    "b": {
                        "uuid": "b",
                        "identifier": "deploy",
                        "step_type": {"type": "noop", "category": "STEP"},
                        "mode": "TASK_V2",
                        "skip_graph_type": "SKIP_NODE"
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(plan.start_node().unwrap().identifier, "build");
        let b = plan.node("b").unwrap();
        assert_eq!(b.mode, ExecutionMode::TaskV2);
        assert_eq!(b.skip_graph_type, SkipType::SkipNode);
        assert_eq!(plan.node("a").unwrap().advisers[0].adviser_type, AdviserType::OnSuccess);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = Plan::from_json(
            r#"{"uuid": "p", "start_node_id": "a", "nodes": {"a": {
                "uuid": "a", "identifier": "a", "step_type": {"type": "x"}, "mode": "WARP"}}}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn missing_start_node_is_rejected() {
        let plan = Plan::new("p", "missing").with_node(PlanNode::new(
            "a",
            "a",
            StepType::step("noop"),
            ExecutionMode::Sync,
        ));
        assert!(matches!(
            plan.validate(),
            Err(PlexusError::PlanNodeNotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn builder_collects_advisers() {
        let node = PlanNode::new("a", "a", StepType::step("noop"), ExecutionMode::Sync)
            .with_adviser(AdviserType::Retry, json!({"retry_count": 2}))
            .with_adviser(AdviserType::OnFail, json!({}));
        assert_eq!(node.advisers.len(), 2);
        assert_eq!(node.advisers[0].adviser_type, AdviserType::Retry);
    }
}

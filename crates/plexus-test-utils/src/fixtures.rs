use std::collections::BTreeMap;
use std::io::Write;

use plexus_core::ambiance::{Ambiance, Level, ACCOUNT_ID_KEY, ORG_ID_KEY, PROJECT_ID_KEY};
use plexus_core::plan::{AdviserType, Plan, PlanNode};
use plexus_core::types::{ExecutionMode, StepCategory, StepType};

/// Builds a `Plan` node by node; the first node added is the start node
/// unless `start` says otherwise.
pub struct PlanBuilder {
    uuid: String,
    start: Option<String>,
    nodes: Vec<PlanNode>,
}

impl PlanBuilder {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            start: None,
            nodes: vec![],
        }
    }

    pub fn start(mut self, node_id: impl Into<String>) -> Self {
        self.start = Some(node_id.into());
        self
    }

    pub fn node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Node with uuid and identifier `id`, running step type `step` in `mode`.
    pub fn step(self, id: &str, step: &str, mode: ExecutionMode) -> Self {
        self.node(plan_node(id, step, mode))
    }

    /// Sync node followed by `next` on success.
    pub fn step_then(self, id: &str, step: &str, next: &str) -> Self {
        self.node(
            plan_node(id, step, ExecutionMode::Sync)
                .with_adviser(AdviserType::OnSuccess, serde_json::json!({ "next_node_id": next })),
        )
    }

    pub fn build(self) -> Plan {
        let start = self
            .start
            .or_else(|| self.nodes.first().map(|n| n.uuid.clone()))
            .unwrap_or_default();
        self.nodes
            .into_iter()
            .fold(Plan::new(self.uuid, start), |plan, node| plan.with_node(node))
    }
}

pub fn plan_node(id: &str, step: &str, mode: ExecutionMode) -> PlanNode {
    PlanNode::new(id, id, StepType::step(step), mode)
}

pub fn setup_abstractions() -> BTreeMap<String, String> {
    BTreeMap::from([
        (ACCOUNT_ID_KEY.to_string(), "account".to_string()),
        (ORG_ID_KEY.to_string(), "default".to_string()),
        (PROJECT_ID_KEY.to_string(), "project".to_string()),
    ])
}

/// pipeline > stage > step context under plan execution `pe-fixture`.
pub fn ambiance_fixture() -> Ambiance {
    Ambiance::new("pe-fixture", "plan-fixture")
        .with_setup_abstractions(setup_abstractions())
        .append(Level::new(
            "pipeline-setup",
            "pipeline-rt",
            "pipeline",
            StepType::new("pipeline", StepCategory::Pipeline),
        ))
        .append(
            Level::new(
                "stage-setup",
                "stage-rt",
                "stage1",
                StepType::new("stage", StepCategory::Stage),
            )
            .with_group(Some("STAGE".to_string())),
        )
        .append(Level::new(
            "step-setup",
            "step-rt",
            "step1",
            StepType::step("shell"),
        ))
}

/// Write `content` to a temporary TOML file.
pub fn temp_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{StepCategory, StepType};

/// Matrix key carrying the disambiguation suffix for duplicate combinations.
pub const MATRIX_DUPLICATE_POSTFIX_KEY: &str = "matrixIdentifierPostfixForDuplicates";

const PARALLEL_IDENTIFIER: &str = "parallel";

pub const ACCOUNT_ID_KEY: &str = "accountId";
pub const ORG_ID_KEY: &str = "orgIdentifier";
pub const PROJECT_ID_KEY: &str = "projectIdentifier";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixMetadata {
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub combination: Vec<u32>,
    #[serde(default)]
    pub node_name: Option<String>,
}

/// Iteration info for levels spawned by a looping/matrix strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub current_iteration: u32,
    pub total_iterations: u32,
    #[serde(default)]
    pub matrix: Option<MatrixMetadata>,
}

/// One frame of the execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Id of the static plan node.
    pub setup_id: String,
    /// Id of the node execution running at this level.
    pub runtime_id: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub retry_index: u32,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub strategy_metadata: Option<StrategyMetadata>,
    #[serde(default)]
    pub skip_expression_chain: bool,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            identifier: identifier.into(),
            step_type,
            group: None,
            retry_index: 0,
            start_ts: Utc::now(),
            strategy_metadata: None,
            skip_expression_chain: false,
        }
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    pub fn with_strategy_metadata(mut self, metadata: Option<StrategyMetadata>) -> Self {
        self.strategy_metadata = metadata;
        self
    }

    pub fn with_skip_expression_chain(mut self, skip: bool) -> Self {
        self.skip_expression_chain = skip;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanExecutionMode {
    #[default]
    Normal,
    PipelineRollback,
    PostExecutionRollback,
}

impl PlanExecutionMode {
    pub fn is_rollback(self) -> bool {
        !matches!(self, PlanExecutionMode::Normal)
    }
}

/// Maps a stage (and iteration) of a post-execution rollback back to the
/// stage execution it is rolling back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostExecutionRollbackInfo {
    pub rollback_stage_id: String,
    #[serde(default)]
    pub rollback_stage_strategy_metadata: Option<StrategyMetadata>,
    pub original_stage_execution_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub run_sequence: u32,
    #[serde(default)]
    pub execution_mode: PlanExecutionMode,
    #[serde(default)]
    pub original_plan_execution_id_for_rollback: Option<String>,
    #[serde(default)]
    pub post_execution_rollback_info: Vec<PostExecutionRollbackInfo>,
    #[serde(default)]
    pub pipeline_identifier: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// The execution context: an append-only stack of levels plus immutable
/// scoping data. Every derivation returns a fresh, independent value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub stage_execution_id: Option<String>,
    #[serde(default)]
    pub original_stage_execution_id_for_rollback: Option<String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

impl Ambiance {
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            ..Default::default()
        }
    }

    pub fn with_setup_abstractions(mut self, abstractions: BTreeMap<String, String>) -> Self {
        self.setup_abstractions = abstractions;
        self
    }

    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Context for work running one level deeper. Entering a stage also
    /// marks the stage execution id.
    pub fn append(&self, level: Level) -> Ambiance {
        let mut next = self.clone();
        if level.step_type.category == StepCategory::Stage {
            next.stage_execution_id = Some(level.runtime_id.clone());
        }
        next.levels.push(level);
        next
    }

    /// Context with the most specific level dropped. Leaving a stage
    /// clears its stage execution id.
    pub fn truncate_to_parent(&self) -> Ambiance {
        let mut next = self.clone();
        if next.levels.pop().is_some() {
            next.sync_stage_execution_id();
        }
        next
    }

    /// Full copy of the lineage for a spawned unit of work.
    pub fn clone_for_child(&self) -> Ambiance {
        self.clone()
    }

    /// Copy keeping only the first `depth` levels.
    pub fn clone_to_depth(&self, depth: usize) -> Ambiance {
        let mut next = self.clone();
        if next.levels.len() > depth {
            next.levels.truncate(depth);
            next.sync_stage_execution_id();
        }
        next
    }

    /// Point the stage execution id at the innermost remaining stage level.
    fn sync_stage_execution_id(&mut self) {
        self.stage_execution_id = self
            .levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
            .map(|l| l.runtime_id.clone());
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id.as_str())
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ACCOUNT_ID_KEY).map(String::as_str)
    }

    pub fn org_id(&self) -> Option<&str> {
        self.setup_abstractions.get(ORG_ID_KEY).map(String::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.setup_abstractions.get(PROJECT_ID_KEY).map(String::as_str)
    }

    /// Innermost stage level, if any.
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
    }

    /// Innermost strategy level, if any.
    pub fn strategy_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Strategy)
    }

    /// Innermost level belonging to `group`.
    pub fn level_for_group(&self, group: &str) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }

    pub fn is_retry(&self) -> bool {
        self.current_level().is_some_and(|l| l.retry_index > 0)
    }

    /// Dotted path of identifiers, as used in expressions.
    pub fn fqn(&self) -> String {
        fqn_from_levels(&self.levels)
    }

    pub fn is_setting_enabled(&self, key: &str) -> bool {
        self.metadata
            .settings
            .get(key)
            .is_some_and(|v| v == "true")
    }

    /// Stage execution id to use for lookups; rollback runs point at the
    /// stage they are rolling back.
    pub fn stage_execution_id_for_execution_mode(&self) -> Option<&str> {
        if self.metadata.execution_mode == PlanExecutionMode::PipelineRollback {
            if let Some(original) = self.original_stage_execution_id_for_rollback.as_deref() {
                return Some(original);
            }
        }
        self.stage_execution_id.as_deref()
    }

    pub fn plan_execution_id_for_execution_mode(&self) -> &str {
        if self.metadata.execution_mode == PlanExecutionMode::PipelineRollback {
            if let Some(original) = self.metadata.original_plan_execution_id_for_rollback.as_deref() {
                return original;
            }
        }
        &self.plan_execution_id
    }

    /// For post-execution rollback: stage execution id of the original run
    /// of `stage_setup_id` at `iteration` (iteration is ignored for stages
    /// not running under a strategy).
    pub fn original_stage_execution_id_for_post_rollback(
        &self,
        stage_setup_id: &str,
        iteration: Option<u32>,
    ) -> Option<&str> {
        self.metadata
            .post_execution_rollback_info
            .iter()
            .find(|info| {
                if info.rollback_stage_id != stage_setup_id {
                    return false;
                }
                match (&info.rollback_stage_strategy_metadata, iteration) {
                    (Some(meta), Some(i)) => meta.current_iteration == i,
                    (None, _) => true,
                    (Some(_), None) => false,
                }
            })
            .map(|info| info.original_stage_execution_id.as_str())
    }
}

/// Identifier suffix for an iteration of a strategy level.
pub fn strategy_postfix(level: &Level, use_matrix_field_name: bool) -> String {
    let Some(meta) = &level.strategy_metadata else {
        return String::new();
    };
    let Some(matrix) = &meta.matrix else {
        return format!("_{}", meta.current_iteration);
    };

    let mut postfix = if let Some(name) = matrix.node_name.as_deref().filter(|n| !n.is_empty()) {
        format!("_{name}")
    } else if use_matrix_field_name {
        // BTreeMap iterates sorted by key
        let parts: Vec<&str> = matrix
            .values
            .iter()
            .filter(|(k, _)| k.as_str() != MATRIX_DUPLICATE_POSTFIX_KEY)
            .map(|(_, v)| v.as_str())
            .collect();
        format!("_{}", parts.join("_"))
    } else {
        let parts: Vec<String> = matrix.combination.iter().map(|c| c.to_string()).collect();
        format!("_{}", parts.join("_"))
    };

    if let Some(dup) = matrix.values.get(MATRIX_DUPLICATE_POSTFIX_KEY) {
        postfix.push('_');
        postfix.push_str(dup);
    }
    postfix
}

pub fn fqn_from_levels(levels: &[Level]) -> String {
    levels
        .iter()
        .filter(|l| !l.skip_expression_chain && l.identifier != PARALLEL_IDENTIFIER)
        .map(|l| l.identifier.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(id: &str, category: StepCategory) -> Level {
        Level::new(
            format!("setup_{id}"),
            format!("rt_{id}"),
            id,
            StepType::new(id, category),
        )
    }

    fn base() -> Ambiance {
        Ambiance::new("plan-exec", "plan")
            .with_setup_abstractions(BTreeMap::from([
                (ACCOUNT_ID_KEY.to_string(), "acc".to_string()),
                (ORG_ID_KEY.to_string(), "org".to_string()),
                (PROJECT_ID_KEY.to_string(), "proj".to_string()),
            ]))
            .append(level("pipeline", StepCategory::Pipeline))
            .append(level("stage1", StepCategory::Stage))
            .append(level("step1", StepCategory::Step))
    }

    #[test]
    fn clone_for_child_is_independent() {
        let ctx = base();
        let mut child = ctx.clone_for_child();
        assert_eq!(child.levels, ctx.levels);

        child.levels.last_mut().unwrap().identifier = "mutated".into();
        let child = child.append(level("extra", StepCategory::Step));
        assert_eq!(child.levels.len(), 4);
        assert_eq!(ctx.levels.len(), 3);
        assert_eq!(ctx.step_identifier(), Some("step1"));
    }

    #[test]
    fn append_and_truncate() {
        let ctx = base();
        let parent = ctx.truncate_to_parent();
        assert_eq!(parent.levels.len(), 2);
        assert_eq!(parent.current_runtime_id(), Some("rt_stage1"));
        assert_eq!(ctx.current_runtime_id(), Some("rt_step1"));
        assert_eq!(ctx.parent_runtime_id(), Some("rt_stage1"));
    }

    #[test]
    fn leaving_a_stage_clears_its_execution_id() {
        let ctx = base();
        assert_eq!(ctx.stage_execution_id.as_deref(), Some("rt_stage1"));

        // Still inside the stage after dropping the step.
        let in_stage = ctx.truncate_to_parent();
        assert_eq!(in_stage.stage_execution_id.as_deref(), Some("rt_stage1"));

        let after_stage = in_stage.truncate_to_parent();
        assert_eq!(after_stage.stage_execution_id, None);
        let sibling = after_stage.append(level("step2", StepCategory::Step));
        assert_eq!(sibling.stage_execution_id, None);

        let next_stage = after_stage.append(level("stage2", StepCategory::Stage));
        assert_eq!(next_stage.stage_execution_id.as_deref(), Some("rt_stage2"));
        assert_eq!(ctx.clone_to_depth(1).stage_execution_id, None);
        assert_eq!(ctx.clone_to_depth(2).stage_execution_id.as_deref(), Some("rt_stage1"));
    }

    #[test]
    fn parent_runtime_id_needs_two_levels() {
        let ctx = Ambiance::new("p", "plan").append(level("pipeline", StepCategory::Pipeline));
        assert_eq!(ctx.parent_runtime_id(), None);
    }

    #[test]
    fn clone_to_depth_keeps_prefix() {
        let ctx = base();
        let shallow = ctx.clone_to_depth(1);
        assert_eq!(shallow.levels.len(), 1);
        assert_eq!(shallow.step_identifier(), Some("pipeline"));
        assert_eq!(ctx.clone_to_depth(10).levels.len(), 3);
    }

    #[test]
    fn scoping_getters() {
        let ctx = base();
        assert_eq!(ctx.account_id(), Some("acc"));
        assert_eq!(ctx.org_id(), Some("org"));
        assert_eq!(ctx.project_id(), Some("proj"));
        assert_eq!(ctx.stage_level().unwrap().identifier, "stage1");
        assert!(ctx.strategy_level().is_none());
        assert_eq!(ctx.stage_execution_id.as_deref(), Some("rt_stage1"));
    }

    #[test]
    fn retry_follows_current_retry_index() {
        let ctx = base();
        assert!(!ctx.is_retry());
        let retried = ctx
            .truncate_to_parent()
            .append(level("step1", StepCategory::Step).with_retry_index(1));
        assert!(retried.is_retry());
    }

    #[test]
    fn fqn_skips_parallel_levels() {
        let levels = vec![
            level("pipeline", StepCategory::Pipeline),
            level("stages", StepCategory::Step),
            level("parallel", StepCategory::Step),
            level("stage1", StepCategory::Stage),
            level("spec", StepCategory::Step),
            level("execution", StepCategory::Step),
            level("step1", StepCategory::Step),
        ];
        assert_eq!(
            fqn_from_levels(&levels),
            "pipeline.stages.stage1.spec.execution.step1"
        );
        assert_eq!(fqn_from_levels(&[]), "");
    }

    #[test]
    fn fqn_skips_strategy_wrappers() {
        let levels = vec![
            level("pipeline", StepCategory::Pipeline),
            level("stages", StepCategory::Step),
            level("stage1", StepCategory::Strategy).with_skip_expression_chain(true),
            level("stage1_1", StepCategory::Stage),
            level("step1", StepCategory::Strategy).with_skip_expression_chain(true),
            level("step1_0", StepCategory::Step),
        ];
        assert_eq!(fqn_from_levels(&levels), "pipeline.stages.stage1_1.step1_0");
    }

    #[test]
    fn rollback_ids_follow_execution_mode() {
        let mut ctx = base();
        ctx.stage_execution_id = Some("currId".into());
        ctx.original_stage_execution_id_for_rollback = Some("origId".into());
        assert_eq!(ctx.stage_execution_id_for_execution_mode(), Some("currId"));
        assert_eq!(ctx.plan_execution_id_for_execution_mode(), "plan-exec");

        ctx.metadata.execution_mode = PlanExecutionMode::PipelineRollback;
        ctx.metadata.original_plan_execution_id_for_rollback = Some("origPlan".into());
        assert_eq!(ctx.stage_execution_id_for_execution_mode(), Some("origId"));
        assert_eq!(ctx.plan_execution_id_for_execution_mode(), "origPlan");
    }

    #[test]
    fn post_rollback_lookup_by_stage_and_iteration() {
        let mut ctx = base();
        ctx.metadata.execution_mode = PlanExecutionMode::PostExecutionRollback;
        ctx.metadata.post_execution_rollback_info = vec![
            PostExecutionRollbackInfo {
                rollback_stage_id: "s1".into(),
                rollback_stage_strategy_metadata: Some(StrategyMetadata {
                    current_iteration: 0,
                    total_iterations: 2,
                    matrix: None,
                }),
                original_stage_execution_id: "orig-0".into(),
            },
            PostExecutionRollbackInfo {
                rollback_stage_id: "s1".into(),
                rollback_stage_strategy_metadata: Some(StrategyMetadata {
                    current_iteration: 1,
                    total_iterations: 2,
                    matrix: None,
                }),
                original_stage_execution_id: "orig-1".into(),
            },
            PostExecutionRollbackInfo {
                rollback_stage_id: "s2".into(),
                rollback_stage_strategy_metadata: None,
                original_stage_execution_id: "orig-s2".into(),
            },
        ];
        assert_eq!(
            ctx.original_stage_execution_id_for_post_rollback("s1", Some(1)),
            Some("orig-1")
        );
        assert_eq!(
            ctx.original_stage_execution_id_for_post_rollback("s2", None),
            Some("orig-s2")
        );
        assert_eq!(ctx.original_stage_execution_id_for_post_rollback("s3", None), None);
    }

    #[test]
    fn settings_are_enabled_only_when_true() {
        let mut ctx = base();
        ctx.metadata.settings = BTreeMap::from([
            ("setting1".to_string(), "true".to_string()),
            ("setting2".to_string(), "false".to_string()),
            ("setting3".to_string(), "some value".to_string()),
        ]);
        assert!(ctx.is_setting_enabled("setting1"));
        assert!(!ctx.is_setting_enabled("setting2"));
        assert!(!ctx.is_setting_enabled("setting3"));
        assert!(!ctx.is_setting_enabled("missing"));
    }

    fn matrix_level(values: &[(&str, &str)], combination: Vec<u32>, node_name: Option<&str>) -> Level {
        let values = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        level("step", StepCategory::Step).with_strategy_metadata(Some(StrategyMetadata {
            current_iteration: 0,
            total_iterations: 1,
            matrix: Some(MatrixMetadata {
                values,
                combination,
                node_name: node_name.map(String::from),
            }),
        }))
    }

    #[test]
    fn postfix_uses_sorted_values() {
        let lvl = matrix_level(
            &[("a", "true"), (MATRIX_DUPLICATE_POSTFIX_KEY, "0"), ("command", "hi")],
            vec![1],
            None,
        );
        assert_eq!(strategy_postfix(&lvl, true), "_true_hi_0");

        let lvl = matrix_level(
            &[("go", "world"), (MATRIX_DUPLICATE_POSTFIX_KEY, "0"), ("java", "a")],
            vec![1],
            None,
        );
        assert_eq!(strategy_postfix(&lvl, true), "_world_a_0");
    }

    #[test]
    fn postfix_prefers_node_name() {
        let values = [("go", "world"), (MATRIX_DUPLICATE_POSTFIX_KEY, "0"), ("java", "a")];
        assert_eq!(strategy_postfix(&matrix_level(&values, vec![1], Some("a")), true), "_a_0");
        assert_eq!(strategy_postfix(&matrix_level(&values, vec![0], Some("a")), false), "_a_0");
    }

    #[test]
    fn postfix_falls_back_to_combination() {
        let values = [("go", "world"), (MATRIX_DUPLICATE_POSTFIX_KEY, "0"), ("java", "a")];
        assert_eq!(strategy_postfix(&matrix_level(&values, vec![0], None), false), "_0_0");
    }

    #[test]
    fn postfix_for_plain_loop_and_no_strategy() {
        let lvl = level("step", StepCategory::Step).with_strategy_metadata(Some(StrategyMetadata {
            current_iteration: 3,
            total_iterations: 5,
            matrix: None,
        }));
        assert_eq!(strategy_postfix(&lvl, true), "_3");
        assert_eq!(strategy_postfix(&level("x", StepCategory::Step), true), "");
    }
}

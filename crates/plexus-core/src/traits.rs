use std::collections::BTreeSet;

use futures::future::BoxFuture;

use crate::error::{PlexusError, Result};
use crate::execution::{NodeExecution, PlanExecution};
use crate::outcome::OutcomeInstance;
use crate::step::*;
use crate::types::Status;

fn unsupported<T: Send + 'static>(step: &str, what: &str) -> BoxFuture<'static, Result<T>> {
    let msg = format!("step '{step}' does not support {what}");
    Box::pin(async move { Err(PlexusError::InvalidRequest(msg)) })
}

/// The business logic behind a plan node. Each method corresponds
/// to one execution mode; a step implements the ones it supports.
pub trait Step: Send + Sync + 'static {
    /// Step type name plan nodes refer to.
    fn step_type(&self) -> &str;

    fn execute_sync(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResponse>> {
        let _ = ctx;
        unsupported(self.step_type(), "sync execution")
    }

    fn execute_async(&self, ctx: StepContext) -> BoxFuture<'_, Result<AsyncExecutableResponse>> {
        let _ = ctx;
        unsupported(self.step_type(), "async execution")
    }

    fn obtain_child(&self, ctx: StepContext) -> BoxFuture<'_, Result<ChildExecutableResponse>> {
        let _ = ctx;
        unsupported(self.step_type(), "child execution")
    }

    fn obtain_children(
        &self,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<ChildrenExecutableResponse>> {
        let _ = ctx;
        unsupported(self.step_type(), "children execution")
    }

    fn start_chain_link(&self, ctx: StepContext) -> BoxFuture<'_, Result<ChainLink>> {
        let _ = ctx;
        unsupported(self.step_type(), "chains")
    }

    fn next_chain_link(
        &self,
        ctx: StepContext,
        responses: ResponseMap,
    ) -> BoxFuture<'_, Result<ChainLink>> {
        let _ = (ctx, responses);
        unsupported(self.step_type(), "chains")
    }

    fn obtain_task(&self, ctx: StepContext) -> BoxFuture<'_, Result<TaskRequest>> {
        let _ = ctx;
        unsupported(self.step_type(), "task execution")
    }

    /// Final result once every awaited response has arrived.
    fn handle_response(
        &self,
        ctx: StepContext,
        responses: ResponseMap,
    ) -> BoxFuture<'_, Result<StepResponse>> {
        let _ = ctx;
        Box::pin(async move { Ok(StepResponse::from_responses(&responses)) })
    }
}

/// Node/plan execution persistence with optimistic locking.
pub trait NodeExecutionStore: Send + Sync + 'static {
    /// Insert a new node execution. Fails if the id is taken.
    fn save(&self, node: NodeExecution) -> BoxFuture<'_, Result<()>>;

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>>;

    /// Compare-and-swap on `node.version`; the stored copy gets version + 1
    /// and is returned.
    fn replace(&self, node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>>;

    /// Direct children of `parent_id`, oldest first.
    fn find_children(
        &self,
        parent_id: &str,
        include_old_retries: bool,
    ) -> BoxFuture<'_, Result<Vec<NodeExecution>>>;

    /// Node executions of a plan execution; an empty `statuses` matches all.
    fn find_by_plan_execution(
        &self,
        plan_execution_id: &str,
        statuses: Vec<Status>,
    ) -> BoxFuture<'_, Result<Vec<NodeExecution>>>;

    /// Re-point every `previous_id == old_id` to `new_id`. Returns the
    /// number of records changed.
    fn relink_previous_id(&self, old_id: &str, new_id: &str) -> BoxFuture<'_, Result<usize>>;

    /// Flag a superseded attempt. Returns false when it was already flagged.
    fn mark_old_retry(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    fn count_children_with_status(
        &self,
        parent_id: &str,
        statuses: Vec<Status>,
    ) -> BoxFuture<'_, Result<usize>>;

    /// Force every non-final node execution of the plan execution to
    /// `Errored`. Returns the number changed.
    fn error_out_active_nodes(&self, plan_execution_id: &str) -> BoxFuture<'_, Result<usize>>;

    /// Distinct statuses of the plan execution's nodes that are not final.
    fn non_final_statuses(
        &self,
        plan_execution_id: &str,
    ) -> BoxFuture<'_, Result<BTreeSet<Status>>> {
        let plan_execution_id = plan_execution_id.to_string();
        Box::pin(async move {
            let nodes = self.find_by_plan_execution(&plan_execution_id, vec![]).await?;
            Ok(nodes
                .into_iter()
                .filter(|n| !n.status.is_final())
                .map(|n| n.status)
                .collect())
        })
    }

    fn save_plan_execution(&self, plan: PlanExecution) -> BoxFuture<'_, Result<()>>;

    fn get_plan_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<PlanExecution>>>;

    /// Compare-and-swap on `plan.version`.
    fn replace_plan_execution(&self, plan: PlanExecution) -> BoxFuture<'_, Result<PlanExecution>>;
}

/// Backing store for published outcomes.
pub trait OutcomeStore: Send + Sync + 'static {
    /// Store an outcome. With `enforce_unique_key` the insert fails with
    /// `DuplicateOutcome` if the (plan execution, scope, name) key exists;
    /// the check and the insert are atomic.
    fn insert(
        &self,
        outcome: OutcomeInstance,
        enforce_unique_key: bool,
    ) -> BoxFuture<'_, Result<()>>;

    fn get(&self, uuid: &str) -> BoxFuture<'_, Result<Option<OutcomeInstance>>>;

    fn get_many(&self, uuids: Vec<String>) -> BoxFuture<'_, Result<Vec<OutcomeInstance>>>;

    /// Newest outcome under the key.
    fn find_latest(
        &self,
        plan_execution_id: &str,
        scope_runtime_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<OutcomeInstance>>>;

    /// Everything published by `producer_runtime_id`, oldest first.
    fn find_all_by_runtime_id(
        &self,
        plan_execution_id: &str,
        producer_runtime_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OutcomeInstance>>>;
}

/// Remote task dispatch client. Results come back out of band through
/// the engine's `notify`.
pub trait TaskDispatcher: Send + Sync + 'static {
    /// Submit a task and return its id.
    fn submit(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>>;
}

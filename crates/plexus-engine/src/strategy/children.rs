use futures::future::BoxFuture;

use plexus_core::error::Result;
use plexus_core::execution::ExecutableResponse;
use plexus_core::step::ResponseMap;
use plexus_core::types::{ExecutionMode, Status};

use super::{
    InvocationStrategy, InvokerPackage, PendingWork, ResumePackage, StrategyOutcome, Suspension,
};

/// Spawns every child at once and resumes when all have finished.
pub struct ChildrenStrategy;

impl InvocationStrategy for ChildrenStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Children]
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let response = package.step.obtain_children(package.ctx.clone()).await?;
            if response.children.is_empty() {
                let finished = package
                    .step
                    .handle_response(package.ctx, ResponseMap::new())
                    .await?;
                return Ok(StrategyOutcome::Completed(finished));
            }
            Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::Running,
                executable_response: ExecutableResponse::Children {
                    child_node_ids: response
                        .children
                        .iter()
                        .map(|c| c.plan_node_id.clone())
                        .collect(),
                },
                work: PendingWork::Children(response.children),
            }))
        })
    }

    fn resume(&self, package: ResumePackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let response = package
                .step
                .handle_response(package.ctx, package.responses)
                .await?;
            Ok(StrategyOutcome::Completed(response))
        })
    }
}

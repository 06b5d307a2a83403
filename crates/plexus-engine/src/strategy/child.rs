use futures::future::BoxFuture;

use plexus_core::error::Result;
use plexus_core::execution::ExecutableResponse;
use plexus_core::step::ChildSpawn;
use plexus_core::types::{ExecutionMode, Status};

use super::{
    InvocationStrategy, InvokerPackage, PendingWork, ResumePackage, StrategyOutcome, Suspension,
};

/// Spawns exactly one child and waits for it.
pub struct ChildStrategy;

impl InvocationStrategy for ChildStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Child]
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let response = package.step.obtain_child(package.ctx).await?;
            Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::Running,
                executable_response: ExecutableResponse::Child {
                    child_node_id: response.child_node_id.clone(),
                },
                work: PendingWork::Children(vec![ChildSpawn::new(response.child_node_id)]),
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

#[cfg(test)]
mod tests {
    use super::super::test_support::package;
    use super::*;
    use plexus_test_utils::ScriptedStep;
    use std::sync::Arc;

    #[tokio::test]
    async fn spawns_the_one_child() {
        let step = Arc::new(ScriptedStep::child("section", "inner"));
        let StrategyOutcome::Suspended(suspension) = ChildStrategy
            .start(package(step, ExecutionMode::Child))
            .await
            .unwrap()
        else {
            panic!("child strategy completed inline");
        };
        assert_eq!(suspension.status, Status::Running);
        assert_eq!(
            suspension.work,
            PendingWork::Children(vec![ChildSpawn::new("inner")])
        );
    }
}

use futures::future::BoxFuture;

use plexus_core::error::Result;
use plexus_core::types::ExecutionMode;

use super::{InvocationStrategy, InvokerPackage, StrategyOutcome};

/// Runs the step inline; never suspends and cannot be resumed.
pub struct SyncStrategy;

impl InvocationStrategy for SyncStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Sync]
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let response = package.step.execute_sync(package.ctx).await?;
            Ok(StrategyOutcome::Completed(response))
        })
    }
}

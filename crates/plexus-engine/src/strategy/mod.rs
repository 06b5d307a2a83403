//! Invocation strategies: the per-mode protocol for starting and resuming
//! a node.
//!
//! A strategy either completes a node on the spot or suspends it, naming
//! the work the engine must set up (callbacks to wait on, children to
//! spawn) and the continuation state to record on the node.

mod asynchronous;
mod chain;
mod child;
mod children;
mod sync;
mod task;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::{ExecutableResponse, NodeExecution};
use plexus_core::step::{ChildSpawn, ResponseMap, StepContext, StepResponse};
use plexus_core::traits::{Step, TaskDispatcher};
use plexus_core::types::{ExecutionMode, Status};

use crate::backoff::RetryPolicy;

pub use asynchronous::AsyncStrategy;
pub use chain::{ChildChainStrategy, TaskChainStrategy};
pub use child::ChildStrategy;
pub use children::ChildrenStrategy;
pub use sync::SyncStrategy;
pub use task::TaskStrategy;

/// Everything needed to start a node.
pub struct InvokerPackage {
    pub node: NodeExecution,
    pub ctx: StepContext,
    pub step: Arc<dyn Step>,
}

/// Everything needed to resume a suspended node.
pub struct ResumePackage {
    pub node: NodeExecution,
    pub ctx: StepContext,
    pub step: Arc<dyn Step>,
    pub responses: ResponseMap,
}

/// Work the engine must arrange before the node can be resumed.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWork {
    /// Wait on these correlation ids (callback or task ids).
    Callbacks(Vec<String>),
    /// Spawn these children and wait for all of them.
    Children(Vec<ChildSpawn>),
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    /// Status the node waits in.
    pub status: Status,
    pub executable_response: ExecutableResponse,
    pub work: PendingWork,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Completed(StepResponse),
    Suspended(Suspension),
}

pub trait InvocationStrategy: Send + Sync + 'static {
    /// Modes this strategy implements.
    fn modes(&self) -> &[ExecutionMode];

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>>;

    fn resume(&self, package: ResumePackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        let mode = package.node.mode;
        Box::pin(async move { Err(PlexusError::ResumeUnsupported(mode)) })
    }
}

/// Mode -> strategy table, built once at startup.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<ExecutionMode, Arc<dyn InvocationStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in strategies. Task modes are only available with a
    /// dispatcher.
    pub fn with_defaults(
        dispatcher: Option<Arc<dyn TaskDispatcher>>,
        dispatch_policy: RetryPolicy,
    ) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(ExecutionMode::Sync, Arc::new(SyncStrategy))?;
        registry.register(ExecutionMode::Async, Arc::new(AsyncStrategy))?;
        registry.register(ExecutionMode::Child, Arc::new(ChildStrategy))?;
        registry.register(ExecutionMode::Children, Arc::new(ChildrenStrategy))?;
        registry.register(ExecutionMode::ChildChain, Arc::new(ChildChainStrategy))?;

        if let Some(dispatcher) = dispatcher {
            for mode in [ExecutionMode::Task, ExecutionMode::TaskV2] {
                registry.register(
                    mode,
                    Arc::new(TaskStrategy::new(mode, dispatcher.clone(), dispatch_policy)?),
                )?;
            }
            for mode in [ExecutionMode::TaskChain, ExecutionMode::TaskChainV2] {
                registry.register(
                    mode,
                    Arc::new(TaskChainStrategy::new(mode, dispatcher.clone(), dispatch_policy)?),
                )?;
            }
        }
        Ok(registry)
    }

    /// Register `strategy` for `mode`; it must declare that mode.
    pub fn register(&mut self, mode: ExecutionMode, strategy: Arc<dyn InvocationStrategy>) -> Result<()> {
        if !strategy.modes().contains(&mode) {
            return Err(PlexusError::InvalidRequest(format!(
                "strategy for {:?} registered under {mode:?}",
                strategy.modes()
            )));
        }
        self.strategies.insert(mode, strategy);
        Ok(())
    }

    pub fn get(&self, mode: ExecutionMode) -> Result<Arc<dyn InvocationStrategy>> {
        self.strategies
            .get(&mode)
            .cloned()
            .ok_or(PlexusError::UnknownExecutionMode(mode))
    }

    pub fn modes(&self) -> Vec<ExecutionMode> {
        let mut modes: Vec<_> = self.strategies.keys().copied().collect();
        modes.sort();
        modes
    }
}

/// True when any response reports a broken or aborted status.
pub(crate) fn any_unsuccessful(responses: &ResponseMap) -> bool {
    StepResponse::from_responses(responses).status != Status::Succeeded
}

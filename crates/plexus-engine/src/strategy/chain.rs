use std::sync::Arc;

use futures::future::BoxFuture;

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::ExecutableResponse;
use plexus_core::step::{ChainLink, ChainTarget, ChildSpawn, ResponseMap, StepContext, TaskProtocol};
use plexus_core::traits::{Step, TaskDispatcher};
use plexus_core::types::{generate_id, ExecutionMode, Status};

use crate::backoff::RetryPolicy;

use super::task::{dispatch, protocol_for};
use super::{
    any_unsuccessful, InvocationStrategy, InvokerPackage, PendingWork, ResumePackage,
    StrategyOutcome, Suspension,
};

async fn finish(step: &dyn Step, ctx: StepContext, responses: ResponseMap) -> Result<StrategyOutcome> {
    Ok(StrategyOutcome::Completed(
        step.handle_response(ctx, responses).await?,
    ))
}

/// Spawns children one link at a time. A link may first suspend on an
/// external callback; the child is spawned once the callback arrives.
pub struct ChildChainStrategy;

impl ChildChainStrategy {
    async fn advance(
        &self,
        step: &dyn Step,
        ctx: StepContext,
        link: ChainLink,
        responses: ResponseMap,
    ) -> Result<StrategyOutcome> {
        let child = match link.target {
            Some(ChainTarget::Child(id)) => Some(id),
            Some(ChainTarget::Task(_)) => {
                return Err(PlexusError::InvalidRequest(format!(
                    "child chain step '{}' produced a task link",
                    step.step_type()
                )))
            }
            None => None,
        };

        if link.suspend {
            let callback_id = generate_id();
            return Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::AsyncWaiting,
                executable_response: ExecutableResponse::ChildChain {
                    next_child_id: child,
                    callback_id: Some(callback_id.clone()),
                    pass_through: link.pass_through,
                    last_link: link.last_link,
                    suspend: true,
                },
                work: PendingWork::Callbacks(vec![callback_id]),
            }));
        }

        match child {
            Some(id) => Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::Running,
                executable_response: ExecutableResponse::ChildChain {
                    next_child_id: Some(id.clone()),
                    callback_id: None,
                    pass_through: link.pass_through,
                    last_link: link.last_link,
                    suspend: false,
                },
                work: PendingWork::Children(vec![ChildSpawn::new(id)]),
            })),
            None => finish(step, ctx, responses).await,
        }
    }
}

impl InvocationStrategy for ChildChainStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::ChildChain]
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let step = package.step.as_ref();
            let link = step.start_chain_link(package.ctx.clone()).await?;
            self.advance(step, package.ctx, link, ResponseMap::new()).await
        })
    }

    fn resume(&self, package: ResumePackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let step = package.step.as_ref();
            let Some(ExecutableResponse::ChildChain {
                next_child_id,
                pass_through,
                last_link,
                suspend,
                ..
            }) = package.node.last_executable_response().cloned()
            else {
                return Err(PlexusError::InvalidRequest(format!(
                    "node {} has no child chain state to resume",
                    package.node.uuid
                )));
            };

            if suspend {
                // The callback released the paused link.
                return match next_child_id {
                    Some(id) => {
                        let link = ChainLink {
                            target: Some(ChainTarget::Child(id)),
                            pass_through,
                            suspend: false,
                            last_link,
                        };
                        self.advance(step, package.ctx, link, package.responses).await
                    }
                    None if last_link => finish(step, package.ctx, package.responses).await,
                    None => {
                        let link = step
                            .next_chain_link(package.ctx.clone(), package.responses.clone())
                            .await?;
                        self.advance(step, package.ctx, link, package.responses).await
                    }
                };
            }

            if last_link || any_unsuccessful(&package.responses) {
                return finish(step, package.ctx, package.responses).await;
            }
            let link = step
                .next_chain_link(package.ctx.clone(), package.responses.clone())
                .await?;
            self.advance(step, package.ctx, link, package.responses).await
        })
    }
}

/// Dispatches remote tasks one link at a time, with the same suspend
/// contract as `ChildChainStrategy`.
pub struct TaskChainStrategy {
    modes: [ExecutionMode; 1],
    protocol: TaskProtocol,
    dispatcher: Arc<dyn TaskDispatcher>,
    policy: RetryPolicy,
}

impl TaskChainStrategy {
    pub fn new(
        mode: ExecutionMode,
        dispatcher: Arc<dyn TaskDispatcher>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let protocol = match mode {
            ExecutionMode::TaskChain | ExecutionMode::TaskChainV2 => protocol_for(mode),
            _ => None,
        }
        .ok_or_else(|| PlexusError::InvalidRequest(format!("{mode:?} is not a task chain mode")))?;
        Ok(Self {
            modes: [mode],
            protocol,
            dispatcher,
            policy,
        })
    }

    async fn advance(
        &self,
        node_execution_id: &str,
        step: &dyn Step,
        ctx: StepContext,
        link: ChainLink,
        responses: ResponseMap,
    ) -> Result<StrategyOutcome> {
        let request = match link.target {
            Some(ChainTarget::Task(request)) => Some(request),
            Some(ChainTarget::Child(_)) => {
                return Err(PlexusError::InvalidRequest(format!(
                    "task chain step '{}' produced a child link",
                    step.step_type()
                )))
            }
            None => None,
        };

        if link.suspend {
            let callback_id = generate_id();
            return Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::AsyncWaiting,
                executable_response: ExecutableResponse::TaskChain {
                    task_id: None,
                    pending_task: request,
                    callback_id: Some(callback_id.clone()),
                    protocol: self.protocol,
                    pass_through: link.pass_through,
                    chain_end: link.last_link,
                    suspend: true,
                },
                work: PendingWork::Callbacks(vec![callback_id]),
            }));
        }

        match request {
            Some(request) => {
                let task_id = dispatch(
                    self.dispatcher.as_ref(),
                    &self.policy,
                    request,
                    self.protocol,
                    node_execution_id,
                )
                .await?;
                Ok(StrategyOutcome::Suspended(Suspension {
                    status: Status::TaskWaiting,
                    executable_response: ExecutableResponse::TaskChain {
                        task_id: Some(task_id.clone()),
                        pending_task: None,
                        callback_id: None,
                        protocol: self.protocol,
                        pass_through: link.pass_through,
                        chain_end: link.last_link,
                        suspend: false,
                    },
                    work: PendingWork::Callbacks(vec![task_id]),
                }))
            }
            None => finish(step, ctx, responses).await,
        }
    }
}

impl InvocationStrategy for TaskChainStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &self.modes
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let step = package.step.as_ref();
            let link = step.start_chain_link(package.ctx.clone()).await?;
            self.advance(&package.node.uuid, step, package.ctx, link, ResponseMap::new())
                .await
        })
    }

    fn resume(&self, package: ResumePackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let step = package.step.as_ref();
            let node_id = package.node.uuid.as_str();
            let Some(ExecutableResponse::TaskChain {
                pending_task,
                pass_through,
                chain_end,
                suspend,
                ..
            }) = package.node.last_executable_response().cloned()
            else {
                return Err(PlexusError::InvalidRequest(format!(
                    "node {node_id} has no task chain state to resume"
                )));
            };

            if suspend {
                return match pending_task {
                    Some(request) => {
                        let link = ChainLink {
                            target: Some(ChainTarget::Task(request)),
                            pass_through,
                            suspend: false,
                            last_link: chain_end,
                        };
                        self.advance(node_id, step, package.ctx, link, package.responses)
                            .await
                    }
                    None if chain_end => finish(step, package.ctx, package.responses).await,
                    None => {
                        let link = step
                            .next_chain_link(package.ctx.clone(), package.responses.clone())
                            .await?;
                        self.advance(node_id, step, package.ctx, link, package.responses)
                            .await
                    }
                };
            }

            if chain_end || any_unsuccessful(&package.responses) {
                return finish(step, package.ctx, package.responses).await;
            }
            let link = step
                .next_chain_link(package.ctx.clone(), package.responses.clone())
                .await?;
            self.advance(node_id, step, package.ctx, link, package.responses)
                .await
        })
    }
}

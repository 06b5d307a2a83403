use tracing::{debug, info};

use plexus_core::ambiance::{Ambiance, Level, StrategyMetadata};
use plexus_core::error::{PlexusError, Result};
use plexus_core::event::OrchestrationEvent;
use plexus_core::execution::NodeExecution;
use plexus_core::plan::PlanNode;
use plexus_core::step::{ChildSpawn, ResponseMap, StepContext};
use plexus_core::types::{generate_id, Status};

use crate::backoff::update_node_execution;
use crate::strategy::{InvokerPackage, PendingWork, ResumePackage, StrategyOutcome};

use super::{Inner, Job};

/// A node execution about to be created.
pub(crate) struct NewNode<'a> {
    /// Ambiance of the enclosing scope; the new level is appended to it.
    pub ambiance: Ambiance,
    pub plan_node: &'a PlanNode,
    pub parent_id: Option<String>,
    pub previous_id: Option<String>,
    pub notify_id: Option<String>,
    pub strategy_metadata: Option<StrategyMetadata>,
}

impl Inner {
    /// Persist a queued node execution and schedule it.
    pub(super) async fn create_node(&self, new: NewNode<'_>) -> Result<NodeExecution> {
        let id = generate_id();
        let plan_node = new.plan_node;
        let level = Level::new(
            &plan_node.uuid,
            &id,
            &plan_node.identifier,
            plan_node.step_type.clone(),
        )
        .with_group(plan_node.group.clone())
        .with_strategy_metadata(new.strategy_metadata)
        .with_skip_expression_chain(plan_node.skip_expression_chain);

        let node = NodeExecution::new(&id, plan_node, new.ambiance.append(level))
            .with_parent(new.parent_id)
            .with_previous(new.previous_id.clone())
            .with_notify_id(new.notify_id);
        self.store.save(node.clone()).await?;

        if let Some(previous_id) = &new.previous_id {
            let next_id = id.clone();
            update_node_execution(self.store.as_ref(), previous_id, &self.update_policy, |n| {
                n.next_id = Some(next_id.clone());
                Ok(())
            })
            .await?;
        }

        self.graphs.on_created(&node, plan_node.skip_graph_type);
        self.event_bus.publish(OrchestrationEvent::NodeCreated {
            plan_execution_id: node.plan_execution_id.clone(),
            node_execution_id: id.clone(),
            node_id: plan_node.uuid.clone(),
        });
        debug!(
            node_execution_id = %id,
            node = %plan_node.identifier,
            mode = ?plan_node.mode,
            "Node execution created"
        );
        self.enqueue(Job::Start {
            node_execution_id: id,
        });
        Ok(node)
    }

    async fn step_context(
        &self,
        node: &NodeExecution,
        plan_node: PlanNode,
        pass_through: Option<serde_json::Value>,
    ) -> Result<StepContext> {
        let step_parameters = self
            .renderer
            .render_value(&node.ambiance, &plan_node.step_parameters)
            .await?;
        Ok(StepContext {
            ambiance: node.ambiance.clone(),
            plan_node,
            step_parameters,
            pass_through,
        })
    }

    /// Start a queued node through the strategy for its mode.
    pub(super) async fn run_node(&self, node_execution_id: &str) -> Result<()> {
        let node = self.get_node(node_execution_id).await?;
        match node.status {
            Status::Queued => {}
            Status::Discontinuing => return self.finish_aborted(node_execution_id).await,
            other => {
                debug!(node_execution_id = %node_execution_id, status = ?other, "Start skipped");
                return Ok(());
            }
        }

        let node = self
            .update_node(node_execution_id, |n| {
                if n.status == Status::Discontinuing {
                    return Err(PlexusError::Cancelled);
                }
                n.transition(Status::Running)
            })
            .await?;

        let plan = self.plan(&node.plan_execution_id)?;
        let plan_node = plan.node(&node.node_id)?.clone();
        let strategy = self.strategies.get(node.mode)?;
        let step = self.steps.get(&plan_node.step_type.type_name)?;
        let ctx = self.step_context(&node, plan_node, None).await?;

        info!(
            node_execution_id = %node.uuid,
            node = %node.identifier,
            mode = ?node.mode,
            attempt = node.retry_count() + 1,
            "Starting node"
        );
        let outcome = strategy
            .start(InvokerPackage {
                node: node.clone(),
                ctx,
                step,
            })
            .await?;
        self.apply_strategy_outcome(node, outcome).await
    }

    /// Resume a suspended node with the responses it was waiting for.
    pub(super) async fn resume_node(&self, node_execution_id: &str, raw: ResponseMap) -> Result<()> {
        let _guard = self
            .locks
            .acquire(&format!("resume:{node_execution_id}"), &self.lock_policy)
            .await?;

        let node = self.get_node(node_execution_id).await?;
        if node.status.is_final() {
            debug!(node_execution_id = %node_execution_id, status = ?node.status, "Resume of finished node ignored");
            return Ok(());
        }
        if node.status == Status::Discontinuing {
            return self.finish_aborted(node_execution_id).await;
        }

        let responses = self.resume.prepare(&node, raw).await?;
        let node = if node.status == Status::Running {
            node
        } else {
            self.update_node(node_execution_id, |n| {
                if n.status == Status::Discontinuing {
                    return Err(PlexusError::Cancelled);
                }
                n.transition(Status::Running)
            })
            .await?
        };

        let plan = self.plan(&node.plan_execution_id)?;
        let plan_node = plan.node(&node.node_id)?.clone();
        let strategy = self.strategies.get(node.mode)?;
        let step = self.steps.get(&plan_node.step_type.type_name)?;
        let pass_through = node
            .last_executable_response()
            .and_then(|r| r.pass_through().cloned());
        let ctx = self.step_context(&node, plan_node, pass_through).await?;

        debug!(
            node_execution_id = %node.uuid,
            responses = responses.len(),
            "Resuming node"
        );
        let outcome = strategy
            .resume(ResumePackage {
                node: node.clone(),
                ctx,
                step,
                responses,
            })
            .await?;
        self.apply_strategy_outcome(node, outcome).await
    }

    async fn apply_strategy_outcome(&self, node: NodeExecution, outcome: StrategyOutcome) -> Result<()> {
        let suspension = match outcome {
            StrategyOutcome::Completed(response) => return self.conclude(&node.uuid, response).await,
            StrategyOutcome::Suspended(suspension) => suspension,
        };

        let status = suspension.status;
        let executable_response = suspension.executable_response;
        let node = self
            .update_node(&node.uuid, |n| {
                if n.status == Status::Discontinuing {
                    return Err(PlexusError::Cancelled);
                }
                n.executable_responses.push(executable_response.clone());
                if n.status != status {
                    n.transition(status)?;
                }
                Ok(())
            })
            .await?;

        match suspension.work {
            PendingWork::Callbacks(ids) => {
                debug!(node_execution_id = %node.uuid, callbacks = ?ids, "Node waiting on callbacks");
                if let Some(responses) = self.waits.register(&node.uuid, ids).await {
                    self.enqueue(Job::Resume {
                        node_execution_id: node.uuid.clone(),
                        responses,
                    });
                } else if self.get_node(&node.uuid).await?.status.is_final() {
                    // Aborted before the wait existed.
                    self.waits.cancel(&node.uuid).await;
                }
                Ok(())
            }
            PendingWork::Children(children) => self.spawn_children(&node, children).await,
            PendingWork::Nothing => Ok(()),
        }
    }

    /// Create one child per spawn, each notifying the parent on its own id.
    async fn spawn_children(&self, parent: &NodeExecution, children: Vec<ChildSpawn>) -> Result<()> {
        let plan = self.plan(&parent.plan_execution_id)?;
        let mut resolved = Vec::with_capacity(children.len());
        for child in children {
            let plan_node = plan.node(&child.plan_node_id)?;
            resolved.push((plan_node, child.strategy_metadata, generate_id()));
        }

        let notify_ids: Vec<String> = resolved.iter().map(|(_, _, id)| id.clone()).collect();
        self.waits.register(&parent.uuid, notify_ids).await;

        for (plan_node, strategy_metadata, notify_id) in resolved {
            self.create_node(NewNode {
                ambiance: parent.ambiance.clone_for_child(),
                plan_node,
                parent_id: Some(parent.uuid.clone()),
                previous_id: None,
                notify_id: Some(notify_id),
                strategy_metadata,
            })
            .await?;
        }
        Ok(())
    }

    /// Queue the sibling that follows `current` in its chain.
    pub(super) async fn spawn_next(&self, current: &NodeExecution, next_node_id: &str) -> Result<()> {
        let plan = self.plan(&current.plan_execution_id)?;
        let plan_node = plan.node(next_node_id)?;
        self.create_node(NewNode {
            ambiance: current.ambiance.truncate_to_parent(),
            plan_node,
            parent_id: current.parent_id.clone(),
            previous_id: Some(current.uuid.clone()),
            notify_id: current.notify_id.clone(),
            strategy_metadata: None,
        })
        .await?;
        Ok(())
    }
}

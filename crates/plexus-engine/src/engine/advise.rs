use std::time::Duration;

use tracing::{debug, info, warn};

use plexus_core::advise::{Advise, InterventionAction};
use plexus_core::error::{PlexusError, Result};
use plexus_core::event::OrchestrationEvent;
use plexus_core::execution::NodeExecution;
use plexus_core::step::{ResponseData, StepResponse};
use plexus_core::types::Status;

use crate::advisor::AdvisingEvent;
use crate::backoff::update_plan_execution;

use super::{Inner, Job};

impl Inner {
    /// Record a step's terminal response, then let the advisers decide what
    /// follows.
    pub(super) async fn conclude(&self, node_execution_id: &str, response: StepResponse) -> Result<()> {
        let node = self.get_node(node_execution_id).await?;
        if node.status == Status::Discontinuing {
            return self.finish_aborted(node_execution_id).await;
        }
        if !response.status.is_final() {
            return Err(PlexusError::InvalidRequest(format!(
                "step for {node_execution_id} finished with non-final status {:?}",
                response.status
            )));
        }

        let mut outcome_refs = Vec::with_capacity(response.outcomes.len());
        for outcome in &response.outcomes {
            let key = self
                .outcomes
                .consume(
                    &node.ambiance,
                    &outcome.name,
                    outcome.value.clone(),
                    outcome.group.as_deref(),
                )
                .await?;
            outcome_refs.push(key);
        }

        let from_status = node.status;
        let status = response.status;
        let failure_info = response.failure_info;
        let node = self
            .update_node(node_execution_id, |n| {
                if n.status == Status::Discontinuing {
                    return Err(PlexusError::Cancelled);
                }
                n.transition(status)?;
                n.failure_info = failure_info.clone();
                n.outcome_refs.extend(outcome_refs.iter().cloned());
                Ok(())
            })
            .await?;

        info!(
            node_execution_id = %node.uuid,
            node = %node.identifier,
            status = ?node.status,
            "Node finished"
        );
        let advise = match self.advise(&node, from_status, false) {
            Err(PlexusError::PlanExecutionNotFound(_)) => {
                debug!(node_execution_id = %node.uuid, "Plan execution already released");
                return Ok(());
            }
            other => other?,
        };
        self.apply_advise(node, advise).await
    }

    fn advise(&self, node: &NodeExecution, from_status: Status, expired: bool) -> Result<Option<Advise>> {
        let plan = self.plan(&node.plan_execution_id)?;
        let plan_node = plan.node(&node.node_id)?;
        let event = AdvisingEvent {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.uuid.clone(),
            failure_info: node.failure_info.clone(),
            is_previous_adviser_expired: expired,
            retry_ids: node.retry_ids.clone(),
            adviser_parameters: serde_json::Value::Null,
            from_status,
            to_status: node.status,
        };
        self.advisers.chain(&plan_node.advisers).advise(&event)
    }

    pub(super) async fn apply_advise(&self, node: NodeExecution, advise: Option<Advise>) -> Result<()> {
        let Some(advise) = advise else {
            return self.end_node(&node).await;
        };
        let recorded = advise.clone();
        let node = self
            .update_node(&node.uuid, |n| {
                n.adviser_response = Some(recorded.clone());
                Ok(())
            })
            .await?;

        match advise {
            Advise::NextStep {
                next_node_id,
                to_status,
            } => {
                let node = match to_status {
                    Some(status) => self.transition(&node.uuid, status).await?,
                    None => node,
                };
                self.next_or_end(&node, next_node_id.as_deref()).await
            }
            Advise::Retry {
                node_execution_id,
                wait_interval_ms,
            } => {
                let copy = self.retry_helper.retry(&node_execution_id).await?;
                self.graphs.on_retried(&node_execution_id, &copy);
                info!(
                    node_execution_id = %node_execution_id,
                    retry = %copy.uuid,
                    wait_ms = wait_interval_ms,
                    "Retry scheduled"
                );
                self.schedule(
                    Job::Start {
                        node_execution_id: copy.uuid,
                    },
                    Duration::from_millis(wait_interval_ms),
                );
                Ok(())
            }
            Advise::InterventionWait {
                timeout_ms,
                timeout_action,
            } => {
                let node = self.transition(&node.uuid, Status::InterventionWaiting).await?;
                warn!(
                    node_execution_id = %node.uuid,
                    timeout_ms,
                    timeout_action = ?timeout_action,
                    "Node waiting for manual intervention"
                );
                self.schedule(
                    Job::Intervene {
                        node_execution_id: node.uuid,
                        action: InterventionAction::from(timeout_action),
                        expired: true,
                    },
                    Duration::from_millis(timeout_ms),
                );
                Ok(())
            }
            Advise::Abort => {
                self.abort_plan(&node.plan_execution_id).await?;
                self.end_node(&node).await
            }
            Advise::Ignore { next_node_id } => {
                let node = self.transition(&node.uuid, Status::IgnoreFailed).await?;
                self.next_or_end(&node, next_node_id.as_deref()).await
            }
            Advise::MarkSuccess { next_node_id } => {
                let node = self.transition(&node.uuid, Status::Succeeded).await?;
                self.next_or_end(&node, next_node_id.as_deref()).await
            }
            Advise::EndPlan { to_status } => {
                self.complete_plan(&node.plan_execution_id, to_status).await?;
                self.abort_plan(&node.plan_execution_id).await?;
                self.end_node(&node).await
            }
        }
    }

    async fn next_or_end(&self, node: &NodeExecution, next_node_id: Option<&str>) -> Result<()> {
        match next_node_id {
            Some(next) => self.spawn_next(node, next).await,
            None => self.end_node(node).await,
        }
    }

    /// The node's branch is done: tell whoever waits on it, or finish the
    /// plan when it is the root.
    pub(super) async fn end_node(&self, node: &NodeExecution) -> Result<()> {
        if let Some(notify_id) = &node.notify_id {
            let notification = self.resume.notification_for(node).await;
            self.notify(notify_id, ResponseData::Child(notification)).await;
            return Ok(());
        }
        if node.parent_id.is_some() {
            debug!(node_execution_id = %node.uuid, "Child without notify id, nothing to wake");
            return Ok(());
        }
        let status = match node.status {
            Status::Succeeded | Status::IgnoreFailed | Status::Skipped => Status::Succeeded,
            other => other,
        };
        self.complete_plan(&node.plan_execution_id, status).await
    }

    /// Finish the plan execution once; later calls are no-ops.
    pub(super) async fn complete_plan(&self, plan_execution_id: &str, status: Status) -> Result<()> {
        let mut completed = false;
        update_plan_execution(self.store.as_ref(), plan_execution_id, &self.update_policy, |plan| {
            completed = !plan.status.is_final();
            if completed {
                plan.finish(status);
            }
            Ok(())
        })
        .await?;

        if completed {
            info!(plan_execution_id = %plan_execution_id, status = ?status, "Plan execution finished");
            self.event_bus.publish(OrchestrationEvent::PlanCompleted {
                plan_execution_id: plan_execution_id.to_string(),
                status,
            });
            self.release_if_settled(plan_execution_id).await;
        }
        Ok(())
    }

    /// Apply a human (or timed-out) decision to a node in intervention.
    pub(super) async fn intervene(
        &self,
        node_execution_id: &str,
        action: InterventionAction,
        expired: bool,
    ) -> Result<()> {
        let node = self.get_node(node_execution_id).await?;
        if node.status != Status::InterventionWaiting {
            if expired {
                debug!(node_execution_id = %node_execution_id, "Intervention timer fired after a decision");
                return Ok(());
            }
            return Err(PlexusError::InvalidRequest(format!(
                "node execution {node_execution_id} is {:?}, not waiting for intervention",
                node.status
            )));
        }
        info!(node_execution_id = %node_execution_id, action = ?action, expired, "Intervention applied");

        match action {
            InterventionAction::Retry => {
                self.transition(node_execution_id, Status::Failed).await?;
                let copy = self.retry_helper.retry(node_execution_id).await?;
                self.graphs.on_retried(node_execution_id, &copy);
                self.enqueue(Job::Start {
                    node_execution_id: copy.uuid,
                });
                Ok(())
            }
            InterventionAction::MarkAsSuccess | InterventionAction::Ignore => {
                let to = if action == InterventionAction::MarkAsSuccess {
                    Status::Succeeded
                } else {
                    Status::IgnoreFailed
                };
                let node = self.transition(node_execution_id, to).await?;
                let advise = self.advise(&node, Status::InterventionWaiting, expired)?;
                self.apply_advise(node, advise).await
            }
            InterventionAction::Abort => {
                let node = self.transition(node_execution_id, Status::Aborted).await?;
                self.end_node(&node).await
            }
            InterventionAction::MarkAsFailure => {
                let node = self.transition(node_execution_id, Status::Failed).await?;
                self.end_node(&node).await
            }
        }
    }
}

use tracing::{info, warn};

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::NodeExecution;
use plexus_core::types::{FailureInfo, Status};

use super::Inner;

impl Inner {
    pub(super) async fn abort_plan(&self, plan_execution_id: &str) -> Result<()> {
        let active: Vec<Status> = Status::ALL.into_iter().filter(|s| !s.is_final()).collect();
        let nodes = self
            .store
            .find_by_plan_execution(plan_execution_id, active)
            .await?;
        info!(plan_execution_id = %plan_execution_id, nodes = nodes.len(), "Aborting plan execution");
        for node in nodes {
            if let Err(e) = self.discontinue(&node).await {
                warn!(node_execution_id = %node.uuid, error = %e, "Could not discontinue node");
            }
        }
        Ok(())
    }

    /// Discontinue a node and every unfinished node beneath it.
    pub(super) async fn interrupt(&self, node_execution_id: &str) -> Result<()> {
        let target = self.get_node(node_execution_id).await?;
        let mut pending = vec![target];
        let mut visited = Vec::new();
        while let Some(node) = pending.pop() {
            pending.extend(self.store.find_children(&node.uuid, false).await?);
            visited.push(node);
        }
        info!(node_execution_id = %node_execution_id, nodes = visited.len(), "Interrupting");
        for node in visited.iter().filter(|n| !n.status.is_final()) {
            self.discontinue(node).await?;
        }
        Ok(())
    }

    /// Cooperative cancellation. Queued and running nodes are flagged and
    /// finish as aborted when they next reach the engine; waiting nodes have
    /// nothing in flight and are aborted right away.
    async fn discontinue(&self, node: &NodeExecution) -> Result<()> {
        match node.status {
            Status::Queued | Status::Running => {
                self.update_node(&node.uuid, |n| {
                    if n.status.is_final() || n.status == Status::Discontinuing {
                        return Ok(());
                    }
                    n.transition(Status::Discontinuing)
                })
                .await?;
                Ok(())
            }
            status if status.is_waiting() => {
                self.waits.cancel(&node.uuid).await;
                self.finish_aborted(&node.uuid).await
            }
            _ => Ok(()),
        }
    }

    /// Finalise a discontinued node as aborted and wake its parent.
    pub(super) async fn finish_aborted(&self, node_execution_id: &str) -> Result<()> {
        let mut was_final = false;
        let node = self
            .update_node(node_execution_id, |n| {
                was_final = n.status.is_final();
                if was_final {
                    return Ok(());
                }
                n.transition(Status::Aborted)
            })
            .await?;
        if was_final {
            return Ok(());
        }
        self.waits.cancel(node_execution_id).await;
        info!(node_execution_id = %node_execution_id, "Node aborted");
        self.end_node(&node).await
    }

    /// Engine-level failure: mark the node errored without consulting
    /// advisers and propagate.
    pub(super) async fn error_node(&self, node_execution_id: &str, error: &PlexusError) -> Result<()> {
        let message = error.to_string();
        let mut was_final = false;
        let node = self
            .update_node(node_execution_id, |n| {
                was_final = n.status.is_final();
                if was_final {
                    return Ok(());
                }
                if n.transition(Status::Errored).is_err() {
                    n.status = Status::Errored;
                    n.end_ts = Some(chrono::Utc::now());
                }
                n.failure_info = Some(FailureInfo::message(message.clone()));
                Ok(())
            })
            .await?;
        if was_final {
            return Ok(());
        }
        self.waits.cancel(node_execution_id).await;
        self.end_node(&node).await
    }
}

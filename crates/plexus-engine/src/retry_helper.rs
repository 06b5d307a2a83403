use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use plexus_core::error::{PlexusError, Result};
use plexus_core::event::{EventBus, OrchestrationEvent};
use plexus_core::execution::NodeExecution;
use plexus_core::traits::NodeExecutionStore;
use plexus_core::types::generate_id;

use crate::backoff::{update_node_execution, RetryPolicy};
use crate::lock::LockManager;

/// Creates the next attempt of a node execution. The caller schedules the
/// returned copy.
pub struct RetryExecutionHelper {
    store: Arc<dyn NodeExecutionStore>,
    locks: Arc<LockManager>,
    update_policy: RetryPolicy,
    event_bus: Arc<EventBus>,
}

impl RetryExecutionHelper {
    pub fn new(
        store: Arc<dyn NodeExecutionStore>,
        locks: Arc<LockManager>,
        update_policy: RetryPolicy,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            locks,
            update_policy,
            event_bus,
        }
    }

    /// Supersede `node_execution_id` with a fresh queued copy.
    pub async fn retry(&self, node_execution_id: &str) -> Result<NodeExecution> {
        let _guard = self.locks.try_acquire(&format!("retry:{node_execution_id}"))?;

        let old = self
            .store
            .get(node_execution_id)
            .await?
            .ok_or_else(|| PlexusError::NodeExecutionNotFound(node_execution_id.to_string()))?;
        if old.old_retry {
            return Err(PlexusError::InvalidRequest(format!(
                "node execution {node_execution_id} was already retried"
            )));
        }
        if !old.status.is_final() {
            return Err(PlexusError::InvalidRequest(format!(
                "node execution {node_execution_id} is still {:?}",
                old.status
            )));
        }

        let level = old.ambiance.current_level().cloned().ok_or_else(|| {
            PlexusError::InvalidRequest(format!("node execution {node_execution_id} has no level"))
        })?;
        let new_id = generate_id();
        let retry_index = level.retry_index + 1;
        let mut new_level = level.with_retry_index(retry_index);
        new_level.runtime_id = new_id.clone();
        new_level.start_ts = Utc::now();
        let ambiance = old.ambiance.truncate_to_parent().append(new_level);

        let copy = old.prepare_retry(new_id.clone(), ambiance);
        self.store.save(copy.clone()).await?;

        let relinked = self.store.relink_previous_id(&old.uuid, &new_id).await?;
        if relinked == 0 {
            debug!(old_id = %old.uuid, new_id = %new_id, "No successors to relink");
        }

        if let Some(previous_id) = &old.previous_id {
            let new_id = new_id.clone();
            let updated = update_node_execution(self.store.as_ref(), previous_id, &self.update_policy, |n| {
                n.next_id = Some(new_id.clone());
                Ok(())
            })
            .await;
            if let Err(e) = updated {
                warn!(previous_id = %previous_id, error = %e, "Could not relink predecessor");
            }
        }

        if !self.store.mark_old_retry(&old.uuid).await? {
            warn!(node_execution_id = %old.uuid, "Attempt was already marked as superseded");
        }

        info!(
            old_id = %old.uuid,
            new_id = %new_id,
            attempt = copy.retry_count() + 1,
            "Node execution retried"
        );
        self.event_bus.publish(OrchestrationEvent::NodeRetried {
            plan_execution_id: old.plan_execution_id.clone(),
            old_id: old.uuid.clone(),
            new_id,
        });
        Ok(copy)
    }
}

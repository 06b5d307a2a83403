use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use plexus_core::error::Result;
use plexus_core::execution::{ExecutableResponse, NodeExecution};
use plexus_core::step::{ChildNotification, ResponseData, ResponseMap};
use plexus_core::traits::NodeExecutionStore;
use plexus_core::types::ExecutionMode;

use crate::outcome::OutcomeService;

/// Prepares the response map a suspended node is resumed with.
pub struct ResumeCoordinator {
    store: Arc<dyn NodeExecutionStore>,
    outcomes: Arc<OutcomeService>,
}

impl ResumeCoordinator {
    pub fn new(store: Arc<dyn NodeExecutionStore>, outcomes: Arc<OutcomeService>) -> Self {
        Self { store, outcomes }
    }

    /// Whether a resume rebuilds its responses from the node's children
    /// instead of passing the delivered ones through. Chains accumulate
    /// only once a link has actually finished, not while paused.
    pub fn should_accumulate(mode: ExecutionMode, last: Option<&ExecutableResponse>) -> bool {
        match mode {
            ExecutionMode::Child => true,
            ExecutionMode::ChildChain | ExecutionMode::TaskChain | ExecutionMode::TaskChainV2 => {
                last.and_then(ExecutableResponse::suspend) == Some(false)
            }
            _ => false,
        }
    }

    /// Response map for resuming `node` after `raw` arrived.
    pub async fn prepare(&self, node: &NodeExecution, raw: ResponseMap) -> Result<ResponseMap> {
        if !Self::should_accumulate(node.mode, node.last_executable_response()) {
            return Ok(raw);
        }
        let mut responses = self.accumulate(node).await?;
        if node.mode.is_task() {
            for (id, data) in raw {
                responses.entry(id).or_insert(data);
            }
        }
        Ok(responses)
    }

    /// One notification per current (non-superseded) child, keyed by the
    /// child's execution id.
    pub async fn accumulate(&self, node: &NodeExecution) -> Result<ResponseMap> {
        let children = self.store.find_children(&node.uuid, false).await?;
        let mut responses = ResponseMap::new();
        for child in &children {
            let notification = self.notification_for(child).await;
            responses.insert(child.uuid.clone(), ResponseData::Child(notification));
        }
        Ok(responses)
    }

    /// Summary of a finished node for its parent. An outcome lookup failure
    /// is recorded on the notification rather than returned.
    pub async fn notification_for(&self, node: &NodeExecution) -> ChildNotification {
        let (outcomes, outcome_error) = match self.outcomes.fetch_outcomes(&node.outcome_refs).await {
            Ok(found) => (
                found
                    .into_iter()
                    .map(|o| (o.name, o.value))
                    .collect::<BTreeMap<_, _>>(),
                None,
            ),
            Err(e) => {
                warn!(
                    node_execution_id = %node.uuid,
                    error = %e,
                    "Could not fetch child outcomes"
                );
                (BTreeMap::new(), Some(e.to_string()))
            }
        };

        ChildNotification {
            node_id: node.node_id.clone(),
            identifier: node.identifier.clone(),
            node_execution_id: node.uuid.clone(),
            status: node.status,
            failure_info: node.failure_info.clone(),
            outcome_refs: node.outcome_refs.clone(),
            outcomes,
            adviser_response: node.adviser_response.clone(),
            outcome_error,
        }
    }
}

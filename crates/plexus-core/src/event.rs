use serde::{Deserialize, Serialize};

use crate::types::Status;

/// Status-change notifications for dashboards and visualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    NodeCreated {
        plan_execution_id: String,
        node_execution_id: String,
        node_id: String,
    },
    NodeStatusChanged {
        plan_execution_id: String,
        node_execution_id: String,
        from: Status,
        to: Status,
    },
    NodeRetried {
        plan_execution_id: String,
        old_id: String,
        new_id: String,
    },
    OutcomeConsumed {
        plan_execution_id: String,
        producer_runtime_id: String,
        name: String,
    },
    PlanCompleted {
        plan_execution_id: String,
        status: Status,
    },
}

impl OrchestrationEvent {
    pub fn plan_execution_id(&self) -> &str {
        match self {
            OrchestrationEvent::NodeCreated { plan_execution_id, .. }
            | OrchestrationEvent::NodeStatusChanged { plan_execution_id, .. }
            | OrchestrationEvent::NodeRetried { plan_execution_id, .. }
            | OrchestrationEvent::OutcomeConsumed { plan_execution_id, .. }
            | OrchestrationEvent::PlanCompleted { plan_execution_id, .. } => plan_execution_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestrationEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use plexus_core::ambiance::ExecutionMetadata;
use plexus_core::execution::NodeExecution;
use plexus_core::plan::Plan;
use plexus_core::types::Status;
use plexus_engine::{EngineBuilder, OrchestrationEngine};

const WAIT: Duration = Duration::from_secs(5);

/// A running engine that stops its worker loop when dropped.
pub struct Harness {
    pub engine: OrchestrationEngine,
    cancel: CancellationToken,
}

impl Harness {
    pub fn new(builder: EngineBuilder) -> Self {
        let engine = builder.build().unwrap();
        let cancel = CancellationToken::new();
        engine.spawn(cancel.clone()).unwrap();
        Self { engine, cancel }
    }

    pub async fn start(&self, plan: Plan) -> String {
        self.engine
            .start_plan(plan, BTreeMap::new(), ExecutionMetadata::default())
            .await
            .unwrap()
    }

    pub async fn finish(&self, plan_execution_id: &str) -> Status {
        tokio::time::timeout(WAIT, self.engine.await_completion(plan_execution_id))
            .await
            .expect("plan did not finish in time")
            .unwrap()
    }

    /// Start `plan` and wait for its final status.
    pub async fn run(&self, plan: Plan) -> (String, Status) {
        let id = self.start(plan).await;
        let status = self.finish(&id).await;
        (id, status)
    }

    /// Poll until the engine holds no plan execution in memory.
    pub async fn wait_released(&self) {
        tokio::time::timeout(WAIT, async {
            while self.engine.active_plan_executions() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("plan executions were not released");
    }

    /// Poll until the current attempt of plan node `node_id` is in `status`.
    pub async fn wait_for(&self, plan_execution_id: &str, node_id: &str, status: Status) -> NodeExecution {
        let poll = async {
            loop {
                if let Some(node) = self.current(plan_execution_id, node_id).await {
                    if node.status == status {
                        return node;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .unwrap_or_else(|_| panic!("{node_id} never reached {status:?}"))
    }

    /// Newest non-superseded execution of plan node `node_id`.
    pub async fn current(&self, plan_execution_id: &str, node_id: &str) -> Option<NodeExecution> {
        self.attempts(plan_execution_id, node_id)
            .await
            .into_iter()
            .find(|n| !n.old_retry)
    }

    /// Every execution of plan node `node_id`, oldest first.
    pub async fn attempts(&self, plan_execution_id: &str, node_id: &str) -> Vec<NodeExecution> {
        self.engine
            .node_executions(plan_execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.node_id == node_id)
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

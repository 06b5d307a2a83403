use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use plexus_core::error::{PlexusError, Result};
use plexus_core::step::{ResponseData, TaskRequest, TaskResponse};
use plexus_core::traits::TaskDispatcher;
use plexus_core::types::{generate_id, FailureInfo, FailureType, Status};
use plexus_engine::OrchestrationEngine;

pub type Submission = (String, TaskRequest);

/// Runs "remote" tasks in-process: submissions are queued and answered by
/// [`run_loopback`] through the engine's `notify`.
pub struct LoopbackDispatcher {
    tx: mpsc::UnboundedSender<Submission>,
}

impl LoopbackDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Submission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskDispatcher for LoopbackDispatcher {
    fn submit(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let task_id = generate_id();
            debug!(task_id = %task_id, task_type = %request.task_type, "Task submitted");
            self.tx
                .send((task_id.clone(), request))
                .map_err(|_| PlexusError::TaskDispatch("loopback worker stopped".into()))?;
            Ok(task_id)
        })
    }
}

/// Result of a loopback task. `"fail": true` fails it; the parameters are
/// echoed back as the payload.
pub fn task_response(task_id: &str, request: &TaskRequest) -> TaskResponse {
    let failed = request
        .parameters
        .get("fail")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    TaskResponse {
        task_id: task_id.to_string(),
        status: if failed { Status::Failed } else { Status::Succeeded },
        payload: request.parameters.clone(),
        failure_info: failed.then(|| {
            FailureInfo::new(
                format!("task '{}' failed", request.task_type),
                FailureType::ApplicationError,
            )
        }),
    }
}

/// Answer submitted tasks until cancelled. A `delay_ms` parameter holds
/// the answer back.
pub async fn run_loopback(
    engine: OrchestrationEngine,
    mut rx: mpsc::UnboundedReceiver<Submission>,
    cancel: CancellationToken,
) {
    info!("Loopback task worker started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Loopback task worker shutting down");
                break;
            }
            submission = rx.recv() => {
                let Some((task_id, request)) = submission else {
                    break;
                };
                let delay = request
                    .parameters
                    .get("delay_ms")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis);
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let response = task_response(&task_id, &request);
                    debug!(task_id = %task_id, status = ?response.status, "Task answered");
                    engine.notify(&task_id, ResponseData::Task(response)).await;
                });
            }
        }
    }
}

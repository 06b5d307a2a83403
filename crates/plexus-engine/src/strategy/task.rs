use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::ExecutableResponse;
use plexus_core::step::{TaskProtocol, TaskRequest};
use plexus_core::traits::TaskDispatcher;
use plexus_core::types::{ExecutionMode, Status};

use crate::backoff::{with_retry, RetryPolicy};

use super::{
    InvocationStrategy, InvokerPackage, PendingWork, ResumePackage, StrategyOutcome, Suspension,
};

/// Wire protocol for a task mode.
pub(crate) fn protocol_for(mode: ExecutionMode) -> Option<TaskProtocol> {
    match mode {
        ExecutionMode::Task | ExecutionMode::TaskChain => Some(TaskProtocol::V1),
        ExecutionMode::TaskV2 | ExecutionMode::TaskChainV2 => Some(TaskProtocol::V2),
        _ => None,
    }
}

/// Submit `request` for the node `callback_token`, retrying transient
/// dispatch failures.
pub(crate) async fn dispatch(
    dispatcher: &dyn TaskDispatcher,
    policy: &RetryPolicy,
    mut request: TaskRequest,
    protocol: TaskProtocol,
    callback_token: &str,
) -> Result<String> {
    request.protocol = protocol;
    request.callback_token = callback_token.to_string();
    let task_id = with_retry(policy, "task dispatch", || dispatcher.submit(request.clone())).await?;
    info!(
        task_id = %task_id,
        task_type = %request.task_type,
        protocol = ?protocol,
        node_execution_id = %callback_token,
        "Task dispatched"
    );
    Ok(task_id)
}

/// Dispatches one remote task and waits for its response.
pub struct TaskStrategy {
    modes: [ExecutionMode; 1],
    protocol: TaskProtocol,
    dispatcher: Arc<dyn TaskDispatcher>,
    policy: RetryPolicy,
}

impl TaskStrategy {
    pub fn new(
        mode: ExecutionMode,
        dispatcher: Arc<dyn TaskDispatcher>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let protocol = match mode {
            ExecutionMode::Task | ExecutionMode::TaskV2 => protocol_for(mode),
            _ => None,
        }
        .ok_or_else(|| PlexusError::InvalidRequest(format!("{mode:?} is not a task mode")))?;
        Ok(Self {
            modes: [mode],
            protocol,
            dispatcher,
            policy,
        })
    }
}

impl InvocationStrategy for TaskStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &self.modes
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let request = package.step.obtain_task(package.ctx).await?;
            let task_id = dispatch(
                self.dispatcher.as_ref(),
                &self.policy,
                request,
                self.protocol,
                &package.node.uuid,
            )
            .await?;
            Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::TaskWaiting,
                executable_response: ExecutableResponse::Task {
                    task_id: task_id.clone(),
                    protocol: self.protocol,
                },
                work: PendingWork::Callbacks(vec![task_id]),
            }))
        })
    }

    fn resume(&self, package: ResumePackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let response = package
                .step
                .handle_response(package.ctx, package.responses)
                .await?;
            Ok(StrategyOutcome::Completed(response))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{package, resume};
    use super::*;
    use plexus_core::step::{ResponseData, ResponseMap, TaskResponse};
    use plexus_core::types::{FailureInfo, FailureType};
    use plexus_test_utils::{RecordingDispatcher, ScriptedStep};
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn v2_dispatch_uses_v2_protocol_and_callback_token() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let strategy = TaskStrategy::new(ExecutionMode::TaskV2, dispatcher.clone(), policy()).unwrap();
        let step = Arc::new(ScriptedStep::task("http", TaskRequest::new("http", json!({"url": "/health"}))));

        let StrategyOutcome::Suspended(suspension) = strategy
            .start(package(step, ExecutionMode::TaskV2))
            .await
            .unwrap()
        else {
            panic!("task strategy completed inline");
        };
        assert_eq!(suspension.status, Status::TaskWaiting);
        assert_eq!(
            suspension.executable_response,
            ExecutableResponse::Task {
                task_id: "task-1".into(),
                protocol: TaskProtocol::V2
            }
        );

        let submitted = dispatcher.submitted();
        let (_, sent) = &submitted[0];
        assert_eq!(sent.protocol, TaskProtocol::V2);
        assert_eq!(sent.callback_token, "step-rt");
    }

    #[tokio::test]
    async fn transient_dispatch_failures_are_retried() {
        let dispatcher = Arc::new(RecordingDispatcher::failing_first(2));
        let strategy = TaskStrategy::new(ExecutionMode::Task, dispatcher.clone(), policy()).unwrap();
        let step = Arc::new(ScriptedStep::task("shell", TaskRequest::new("shell", json!({}))));
        strategy
            .start(package(step, ExecutionMode::Task))
            .await
            .unwrap();
        assert_eq!(dispatcher.attempts(), 3);
        assert_eq!(dispatcher.submitted().len(), 1);
    }

    #[tokio::test]
    async fn persistent_dispatch_failure_surfaces() {
        let dispatcher = Arc::new(RecordingDispatcher::failing_first(10));
        let strategy = TaskStrategy::new(ExecutionMode::Task, dispatcher.clone(), policy()).unwrap();
        let step = Arc::new(ScriptedStep::task("shell", TaskRequest::new("shell", json!({}))));
        let err = strategy
            .start(package(step, ExecutionMode::Task))
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::TaskDispatch(_)));
        assert_eq!(dispatcher.attempts(), 3);
    }

    #[tokio::test]
    async fn failed_task_response_fails_the_node() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let strategy = TaskStrategy::new(ExecutionMode::Task, dispatcher, policy()).unwrap();
        let step = Arc::new(ScriptedStep::task("shell", TaskRequest::new("shell", json!({}))));
        let responses = ResponseMap::from([(
            "task-1".to_string(),
            ResponseData::Task(TaskResponse {
                task_id: "task-1".into(),
                status: Status::Failed,
                payload: json!(null),
                failure_info: Some(FailureInfo::new("exit 1", FailureType::ApplicationError)),
            }),
        )]);
        let pkg = resume(
            package(step, ExecutionMode::Task),
            ExecutableResponse::Task {
                task_id: "task-1".into(),
                protocol: TaskProtocol::V1,
            },
            responses,
        );
        let StrategyOutcome::Completed(response) = strategy.resume(pkg).await.unwrap() else {
            panic!("task resume suspended");
        };
        assert_eq!(response.status, Status::Failed);
    }

    #[test]
    fn non_task_mode_is_rejected() {
        let result = TaskStrategy::new(
            ExecutionMode::TaskChain,
            Arc::new(RecordingDispatcher::new()),
            policy(),
        );
        assert!(matches!(result, Err(PlexusError::InvalidRequest(_))));
    }
}

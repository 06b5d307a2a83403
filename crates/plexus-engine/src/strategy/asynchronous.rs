use futures::future::BoxFuture;

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::ExecutableResponse;
use plexus_core::types::{ExecutionMode, Status};

use super::{
    InvocationStrategy, InvokerPackage, PendingWork, ResumePackage, StrategyOutcome, Suspension,
};

/// Hands off to an external system and waits for its callbacks.
pub struct AsyncStrategy;

impl InvocationStrategy for AsyncStrategy {
    fn modes(&self) -> &[ExecutionMode] {
        &[ExecutionMode::Async]
    }

    fn start(&self, package: InvokerPackage) -> BoxFuture<'_, Result<StrategyOutcome>> {
        Box::pin(async move {
            let response = package.step.execute_async(package.ctx).await?;
            if response.callback_ids.is_empty() {
                return Err(PlexusError::InvalidRequest(format!(
                    "async step '{}' returned no callback ids",
                    package.step.step_type()
                )));
            }
            Ok(StrategyOutcome::Suspended(Suspension {
                status: Status::AsyncWaiting,
                executable_response: ExecutableResponse::Async {
                    callback_ids: response.callback_ids.clone(),
                },
                work: PendingWork::Callbacks(response.callback_ids),
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
    use plexus_core::step::{ResponseData, ResponseMap};
    use plexus_test_utils::ScriptedStep;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn suspends_on_callbacks_then_completes() {
        let step = Arc::new(ScriptedStep::asynchronous("approval", vec!["cb-1".into()]));
        let outcome = AsyncStrategy
            .start(package(step.clone(), ExecutionMode::Async))
            .await
            .unwrap();
        let StrategyOutcome::Suspended(suspension) = outcome else {
            panic!("async strategy completed inline");
        };
        assert_eq!(suspension.status, Status::AsyncWaiting);
        assert_eq!(suspension.work, PendingWork::Callbacks(vec!["cb-1".into()]));

        let responses = ResponseMap::from([(
            "cb-1".to_string(),
            ResponseData::Callback(json!({"approved": true})),
        )]);
        let pkg = resume(
            package(step.clone(), ExecutionMode::Async),
            suspension.executable_response,
            responses,
        );
        let StrategyOutcome::Completed(response) = AsyncStrategy.resume(pkg).await.unwrap() else {
            panic!("async resume suspended again");
        };
        assert_eq!(response.status, Status::Succeeded);
        assert_eq!(step.resumes().len(), 1);
    }

    #[tokio::test]
    async fn no_callback_ids_is_a_defect() {
        let step = Arc::new(ScriptedStep::asynchronous("approval", vec![]));
        let err = AsyncStrategy
            .start(package(step, ExecutionMode::Async))
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::InvalidRequest(_)));
    }
}

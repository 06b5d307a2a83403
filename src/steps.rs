//! Demo steps so a plan file can run end to end from the command line.
//!
//! Each step reads its `step_parameters` (already rendered by the engine)
//! and does nothing more than shape the control flow.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use plexus_core::error::{PlexusError, Result};
use plexus_core::step::{
    ChainLink, ChildExecutableResponse, ChildSpawn, ChildrenExecutableResponse, ResponseData,
    ResponseMap, StepContext, StepOutcome, StepResponse, TaskRequest,
};
use plexus_core::traits::Step;
use plexus_core::types::{ExecutionMode, FailureInfo, FailureType};

/// Every demo step, ready for `EngineBuilder::with_step`.
pub fn builtin_steps() -> Vec<Arc<dyn Step>> {
    vec![
        Arc::new(NoopStep),
        Arc::new(EchoStep),
        Arc::new(FailStep),
        Arc::new(ForkStep),
        Arc::new(SectionStep),
        Arc::new(ChainStep),
        Arc::new(RemoteStep),
    ]
}

fn parameters<T: DeserializeOwned>(ctx: &StepContext) -> Result<T> {
    let value = match &ctx.step_parameters {
        Value::Null => json!({}),
        v => v.clone(),
    };
    serde_json::from_value(value).map_err(|e| {
        PlexusError::InvalidRequest(format!(
            "bad parameters for node '{}': {e}",
            ctx.plan_node.identifier
        ))
    })
}

pub struct NoopStep;

impl Step for NoopStep {
    fn step_type(&self) -> &str {
        "noop"
    }

    fn execute_sync(&self, _ctx: StepContext) -> BoxFuture<'_, Result<StepResponse>> {
        Box::pin(async { Ok(StepResponse::succeeded()) })
    }
}

#[derive(Debug, Default, Deserialize)]
struct EchoParameters {
    #[serde(default)]
    message: Option<String>,
    /// Outcome name; defaults to `echo`.
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

/// Logs its message and publishes its parameters as an outcome.
pub struct EchoStep;

impl Step for EchoStep {
    fn step_type(&self) -> &str {
        "echo"
    }

    fn execute_sync(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResponse>> {
        Box::pin(async move {
            let params: EchoParameters = parameters(&ctx)?;
            if let Some(message) = &params.message {
                info!(node = %ctx.plan_node.identifier, "{message}");
            }
            let mut response = StepResponse::succeeded();
            response.outcomes.push(StepOutcome {
                name: params.outcome.unwrap_or_else(|| "echo".to_string()),
                value: ctx.step_parameters.clone(),
                group: params.group,
            });
            Ok(response)
        })
    }
}

#[derive(Debug, Deserialize)]
struct FailParameters {
    #[serde(default = "default_fail_message")]
    message: String,
    #[serde(default = "default_failure_type")]
    failure_type: FailureType,
    /// Succeed from this retry index on.
    #[serde(default)]
    succeed_after: Option<u32>,
}

fn default_fail_message() -> String { "failed on purpose".to_string() }
fn default_failure_type() -> FailureType { FailureType::ApplicationError }

/// Fails, optionally only for the first few attempts.
pub struct FailStep;

impl Step for FailStep {
    fn step_type(&self) -> &str {
        "fail"
    }

    fn execute_sync(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResponse>> {
        Box::pin(async move {
            let params: FailParameters = parameters(&ctx)?;
            let attempt = ctx
                .ambiance
                .current_level()
                .map(|l| l.retry_index)
                .unwrap_or(0);
            if params.succeed_after.is_some_and(|n| attempt >= n) {
                return Ok(StepResponse::succeeded());
            }
            Ok(StepResponse::failed(FailureInfo::new(
                params.message,
                params.failure_type,
            )))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ForkParameters {
    children: Vec<String>,
}

/// Runs the listed plan nodes in parallel.
pub struct ForkStep;

impl Step for ForkStep {
    fn step_type(&self) -> &str {
        "fork"
    }

    fn obtain_children(
        &self,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<ChildrenExecutableResponse>> {
        Box::pin(async move {
            let params: ForkParameters = parameters(&ctx)?;
            if params.children.is_empty() {
                return Err(PlexusError::InvalidRequest(format!(
                    "fork '{}' lists no children",
                    ctx.plan_node.identifier
                )));
            }
            Ok(ChildrenExecutableResponse {
                children: params.children.into_iter().map(ChildSpawn::new).collect(),
            })
        })
    }
}

#[derive(Debug, Deserialize)]
struct SectionParameters {
    child: String,
}

/// Wraps a single child branch, typically to scope group outcomes.
pub struct SectionStep;

impl Step for SectionStep {
    fn step_type(&self) -> &str {
        "section"
    }

    fn obtain_child(&self, ctx: StepContext) -> BoxFuture<'_, Result<ChildExecutableResponse>> {
        Box::pin(async move {
            let params: SectionParameters = parameters(&ctx)?;
            Ok(ChildExecutableResponse {
                child_node_id: params.child,
            })
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChainParameters {
    /// Child plan node ids, or task types when run in a task chain mode.
    #[serde(default)]
    links: Vec<String>,
}

/// Walks `links` one at a time. The current index rides along as the
/// link's pass-through data.
pub struct ChainStep;

impl ChainStep {
    fn link(ctx: &StepContext, links: &[String], index: usize) -> ChainLink {
        let Some(target) = links.get(index) else {
            return ChainLink::end();
        };
        let mut link = match ctx.plan_node.mode {
            ExecutionMode::TaskChain | ExecutionMode::TaskChainV2 => {
                ChainLink::task(TaskRequest::new(target, json!({ "link": index })))
            }
            _ => ChainLink::child(target),
        };
        link.pass_through = Some(json!({ "index": index }));
        if index + 1 == links.len() {
            link = link.last();
        }
        link
    }
}

impl Step for ChainStep {
    fn step_type(&self) -> &str {
        "chain"
    }

    fn start_chain_link(&self, ctx: StepContext) -> BoxFuture<'_, Result<ChainLink>> {
        Box::pin(async move {
            let params: ChainParameters = parameters(&ctx)?;
            Ok(Self::link(&ctx, &params.links, 0))
        })
    }

    fn next_chain_link(
        &self,
        ctx: StepContext,
        _responses: ResponseMap,
    ) -> BoxFuture<'_, Result<ChainLink>> {
        Box::pin(async move {
            let params: ChainParameters = parameters(&ctx)?;
            let next = ctx
                .pass_through
                .as_ref()
                .and_then(|p| p.get("index"))
                .and_then(Value::as_u64)
                .map_or(0, |i| i as usize + 1);
            Ok(Self::link(&ctx, &params.links, next))
        })
    }
}

#[derive(Debug, Deserialize)]
struct RemoteParameters {
    #[serde(default = "default_task_type")]
    task_type: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_task_type() -> String { "remote".to_string() }

/// Hands its parameters to the task dispatcher and publishes the task
/// payloads as the `remote` outcome.
pub struct RemoteStep;

impl Step for RemoteStep {
    fn step_type(&self) -> &str {
        "remote"
    }

    fn obtain_task(&self, ctx: StepContext) -> BoxFuture<'_, Result<TaskRequest>> {
        Box::pin(async move {
            let params: RemoteParameters = parameters(&ctx)?;
            let mut request = TaskRequest::new(params.task_type, params.parameters);
            request.timeout_ms = params.timeout_ms;
            Ok(request)
        })
    }

    fn handle_response(
        &self,
        _ctx: StepContext,
        responses: ResponseMap,
    ) -> BoxFuture<'_, Result<StepResponse>> {
        Box::pin(async move {
            let response = StepResponse::from_responses(&responses);
            if response.status.is_broken() {
                return Ok(response);
            }
            let payloads: Vec<Value> = responses
                .values()
                .filter_map(|data| match data {
                    ResponseData::Task(task) => Some(task.payload.clone()),
                    _ => None,
                })
                .collect();
            Ok(response.with_outcome("remote", Value::Array(payloads)))
        })
    }
}

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use plexus_core::error::{PlexusError, Result};
use plexus_core::step::*;
use plexus_core::traits::Step;
use plexus_core::types::{FailureInfo, FailureType, Status};

/// What a scripted step does when started.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Sync,
    Async { callback_ids: Vec<String> },
    Child { child_node_id: String },
    Children { child_node_ids: Vec<String> },
    /// Links served in order: the first on start, the rest on each resume.
    Chain { links: Vec<ChainLink> },
    Task { request: TaskRequest },
}

/// A `Step` with programmable behaviour that records what it was resumed with.
pub struct ScriptedStep {
    step_type: String,
    behaviour: Behaviour,
    fail_first: u32,
    failure: FailureInfo,
    final_status: Option<Status>,
    outcomes: Vec<StepOutcome>,
    starts: AtomicU32,
    links_served: AtomicUsize,
    resumes: Mutex<Vec<ResponseMap>>,
    contexts: Mutex<Vec<StepContext>>,
}

impl ScriptedStep {
    fn new(step_type: impl Into<String>, behaviour: Behaviour) -> Self {
        Self {
            step_type: step_type.into(),
            behaviour,
            fail_first: 0,
            failure: FailureInfo::new("scripted failure", FailureType::ApplicationError),
            final_status: None,
            outcomes: vec![],
            starts: AtomicU32::new(0),
            links_served: AtomicUsize::new(0),
            resumes: Mutex::new(vec![]),
            contexts: Mutex::new(vec![]),
        }
    }

    pub fn sync(step_type: impl Into<String>) -> Self {
        Self::new(step_type, Behaviour::Sync)
    }

    pub fn asynchronous(step_type: impl Into<String>, callback_ids: Vec<String>) -> Self {
        Self::new(step_type, Behaviour::Async { callback_ids })
    }

    pub fn child(step_type: impl Into<String>, child_node_id: impl Into<String>) -> Self {
        Self::new(
            step_type,
            Behaviour::Child {
                child_node_id: child_node_id.into(),
            },
        )
    }

    pub fn children(step_type: impl Into<String>, child_node_ids: &[&str]) -> Self {
        Self::new(
            step_type,
            Behaviour::Children {
                child_node_ids: child_node_ids.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn chain(step_type: impl Into<String>, links: Vec<ChainLink>) -> Self {
        Self::new(step_type, Behaviour::Chain { links })
    }

    pub fn task(step_type: impl Into<String>, request: TaskRequest) -> Self {
        Self::new(step_type, Behaviour::Task { request })
    }

    /// Fail the first `n` sync runs with `failure`.
    pub fn failing_first(mut self, n: u32, failure: FailureInfo) -> Self {
        self.fail_first = n;
        self.failure = failure;
        self
    }

    /// Always fail with `failure`.
    pub fn always_failing(self, failure: FailureInfo) -> Self {
        self.failing_first(u32::MAX, failure)
    }

    /// Force the status reported by sync runs and `handle_response`.
    pub fn finishing_with(mut self, status: Status) -> Self {
        self.final_status = Some(status);
        self
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.outcomes.push(StepOutcome {
            name: name.into(),
            value,
            group: None,
        });
        self
    }

    pub fn with_group_outcome(
        mut self,
        name: impl Into<String>,
        value: serde_json::Value,
        group: impl Into<String>,
    ) -> Self {
        self.outcomes.push(StepOutcome {
            name: name.into(),
            value,
            group: Some(group.into()),
        });
        self
    }

    /// Times the step was started (any mode).
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Response maps passed to `next_chain_link` and `handle_response`.
    pub fn resumes(&self) -> Vec<ResponseMap> {
        self.resumes.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Contexts the step was started with.
    pub fn contexts(&self) -> Vec<StepContext> {
        self.contexts.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record_start(&self, ctx: &StepContext) -> u32 {
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.push(ctx.clone());
        }
        self.starts.fetch_add(1, Ordering::SeqCst)
    }

    fn record_resume(&self, responses: &ResponseMap) {
        if let Ok(mut resumes) = self.resumes.lock() {
            resumes.push(responses.clone());
        }
    }

    fn finish(&self, mut response: StepResponse) -> StepResponse {
        if let Some(status) = self.final_status {
            response.status = status;
        }
        if !response.status.is_broken() {
            response.outcomes.extend(self.outcomes.iter().cloned());
        }
        response
    }

    fn next_link(&self) -> Result<ChainLink> {
        let Behaviour::Chain { links } = &self.behaviour else {
            return Err(PlexusError::InvalidRequest(format!(
                "step '{}' is not a chain",
                self.step_type
            )));
        };
        let i = self.links_served.fetch_add(1, Ordering::SeqCst);
        Ok(links.get(i).cloned().unwrap_or_else(ChainLink::end))
    }

    fn mismatch<T>(&self, mode: &str) -> Result<T> {
        Err(PlexusError::InvalidRequest(format!(
            "scripted step '{}' was not scripted for {mode}",
            self.step_type
        )))
    }
}

impl Step for ScriptedStep {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn execute_sync(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResponse>> {
        Box::pin(async move {
            let run = self.record_start(&ctx);
            if !matches!(self.behaviour, Behaviour::Sync) {
                return self.mismatch("sync");
            }
            if run < self.fail_first {
                return Ok(StepResponse::failed(self.failure.clone()));
            }
            Ok(self.finish(StepResponse::succeeded()))
        })
    }

    fn execute_async(&self, ctx: StepContext) -> BoxFuture<'_, Result<AsyncExecutableResponse>> {
        Box::pin(async move {
            self.record_start(&ctx);
            match &self.behaviour {
                Behaviour::Async { callback_ids } => Ok(AsyncExecutableResponse {
                    callback_ids: callback_ids.clone(),
                }),
                _ => self.mismatch("async"),
            }
        })
    }

    fn obtain_child(&self, ctx: StepContext) -> BoxFuture<'_, Result<ChildExecutableResponse>> {
        Box::pin(async move {
            self.record_start(&ctx);
            match &self.behaviour {
                Behaviour::Child { child_node_id } => Ok(ChildExecutableResponse {
                    child_node_id: child_node_id.clone(),
                }),
                _ => self.mismatch("child"),
            }
        })
    }

    fn obtain_children(
        &self,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<ChildrenExecutableResponse>> {
        Box::pin(async move {
            self.record_start(&ctx);
            match &self.behaviour {
                Behaviour::Children { child_node_ids } => Ok(ChildrenExecutableResponse {
                    children: child_node_ids.iter().map(ChildSpawn::new).collect(),
                }),
                _ => self.mismatch("children"),
            }
        })
    }

    fn start_chain_link(&self, ctx: StepContext) -> BoxFuture<'_, Result<ChainLink>> {
        Box::pin(async move {
            self.record_start(&ctx);
            self.next_link()
        })
    }

    fn next_chain_link(
        &self,
        _ctx: StepContext,
        responses: ResponseMap,
    ) -> BoxFuture<'_, Result<ChainLink>> {
        Box::pin(async move {
            self.record_resume(&responses);
            self.next_link()
        })
    }

    fn obtain_task(&self, ctx: StepContext) -> BoxFuture<'_, Result<TaskRequest>> {
        Box::pin(async move {
            self.record_start(&ctx);
            match &self.behaviour {
                Behaviour::Task { request } => Ok(request.clone()),
                _ => self.mismatch("task"),
            }
        })
    }

    fn handle_response(
        &self,
        _ctx: StepContext,
        responses: ResponseMap,
    ) -> BoxFuture<'_, Result<StepResponse>> {
        Box::pin(async move {
            self.record_resume(&responses);
            Ok(self.finish(StepResponse::from_responses(&responses)))
        })
    }
}

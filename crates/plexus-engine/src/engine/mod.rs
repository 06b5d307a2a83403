//! Composition root: wires every component once and drives node executions
//! through a bounded worker loop.
//!
//! All work is expressed as [`Job`]s on one channel. Strategy suspensions,
//! retry timers and intervention timeouts never call back into the engine
//! directly; they enqueue a job, so no invocation ever holds a worker while
//! it waits for something external.

mod advise;
mod builder;
mod interrupt;
mod invoke;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plexus_core::advise::InterventionAction;
use plexus_core::ambiance::{Ambiance, ExecutionMetadata};
use plexus_core::error::{PlexusError, Result};
use plexus_core::event::{EventBus, OrchestrationEvent};
use plexus_core::execution::{NodeExecution, PlanExecution};
use plexus_core::plan::Plan;
use plexus_core::step::{ResponseData, ResponseMap};
use plexus_core::traits::NodeExecutionStore;
use plexus_core::types::{generate_id, Status};

use crate::advisor::AdviserRegistry;
use crate::backoff::{update_node_execution, RetryPolicy};
use crate::expression::ExpressionRenderer;
use crate::graph::{ExecutionGraph, GraphService};
use crate::lock::LockManager;
use crate::outcome::OutcomeService;
use crate::registry::StepRegistry;
use crate::resume::ResumeCoordinator;
use crate::retry_helper::RetryExecutionHelper;
use crate::strategy::StrategyRegistry;
use crate::wait::WaitRegistry;

pub use builder::EngineBuilder;

/// A unit of work for the worker loop.
#[derive(Debug)]
pub(crate) enum Job {
    Start {
        node_execution_id: String,
    },
    Resume {
        node_execution_id: String,
        responses: ResponseMap,
    },
    Intervene {
        node_execution_id: String,
        action: InterventionAction,
        expired: bool,
    },
}

impl Job {
    fn node_execution_id(&self) -> &str {
        match self {
            Job::Start { node_execution_id }
            | Job::Resume { node_execution_id, .. }
            | Job::Intervene { node_execution_id, .. } => node_execution_id,
        }
    }
}

pub(crate) struct Inner {
    store: Arc<dyn NodeExecutionStore>,
    outcomes: Arc<OutcomeService>,
    renderer: ExpressionRenderer,
    steps: StepRegistry,
    strategies: StrategyRegistry,
    advisers: AdviserRegistry,
    resume: ResumeCoordinator,
    retry_helper: RetryExecutionHelper,
    waits: WaitRegistry,
    locks: Arc<LockManager>,
    graphs: GraphService,
    event_bus: Arc<EventBus>,
    plans: RwLock<HashMap<String, Arc<Plan>>>,
    jobs: mpsc::UnboundedSender<Job>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    permits: Arc<Semaphore>,
    update_policy: RetryPolicy,
    lock_policy: RetryPolicy,
}

/// Handle to a running orchestration engine. Cheap to clone.
#[derive(Clone)]
pub struct OrchestrationEngine {
    inner: Arc<Inner>,
}

impl OrchestrationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start the worker loop. Can only be called once per engine.
    pub fn spawn(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let receiver = self
            .inner
            .receiver
            .lock()
            .map_err(|_| PlexusError::InvalidRequest("engine state poisoned".into()))?
            .take()
            .ok_or_else(|| PlexusError::InvalidRequest("engine is already running".into()))?;
        let inner = self.inner.clone();
        Ok(tokio::spawn(inner.run(receiver, cancel)))
    }

    /// Create a plan execution and queue its start node.
    pub async fn start_plan(
        &self,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
        metadata: ExecutionMetadata,
    ) -> Result<String> {
        plan.validate()?;
        let plan_execution_id = generate_id();
        let start = plan.start_node()?.clone();

        self.inner
            .store
            .save_plan_execution(PlanExecution::new(&plan_execution_id, &plan.uuid))
            .await?;
        let ambiance = Ambiance::new(&plan_execution_id, &plan.uuid)
            .with_setup_abstractions(setup_abstractions)
            .with_metadata(metadata);
        self.inner
            .plans
            .write()
            .map_err(|_| PlexusError::InvalidRequest("plan table poisoned".into()))?
            .insert(plan_execution_id.clone(), Arc::new(plan));

        info!(plan_execution_id = %plan_execution_id, start = %start.identifier, "Plan execution started");
        self.inner
            .create_node(invoke::NewNode {
                ambiance,
                plan_node: &start,
                parent_id: None,
                previous_id: None,
                notify_id: None,
                strategy_metadata: None,
            })
            .await?;
        Ok(plan_execution_id)
    }

    /// Deliver an out-of-band response (callback or task result).
    pub async fn notify(&self, correlation_id: &str, data: ResponseData) {
        self.inner.notify(correlation_id, data).await;
    }

    /// Discontinue every unfinished node of the plan execution.
    pub async fn abort_plan(&self, plan_execution_id: &str) -> Result<()> {
        self.inner.abort_plan(plan_execution_id).await
    }

    /// Discontinue one node execution and everything running beneath it.
    pub async fn interrupt(&self, node_execution_id: &str) -> Result<()> {
        self.inner.interrupt(node_execution_id).await
    }

    /// Resolve a node paused in `InterventionWaiting`.
    pub async fn intervene(&self, node_execution_id: &str, action: InterventionAction) -> Result<()> {
        self.inner.intervene(node_execution_id, action, false).await
    }

    /// Wait until the plan execution reaches a final status.
    pub async fn await_completion(&self, plan_execution_id: &str) -> Result<Status> {
        let mut rx = self.inner.event_bus.subscribe();
        if let Some(status) = self.final_plan_status(plan_execution_id).await? {
            return Ok(status);
        }
        loop {
            match rx.recv().await {
                Ok(OrchestrationEvent::PlanCompleted {
                    plan_execution_id: id,
                    status,
                }) if id == plan_execution_id => return Ok(status),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Completion watcher lagged, re-reading plan status");
                    if let Some(status) = self.final_plan_status(plan_execution_id).await? {
                        return Ok(status);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(PlexusError::Cancelled),
            }
        }
    }

    async fn final_plan_status(&self, plan_execution_id: &str) -> Result<Option<Status>> {
        let plan = self
            .inner
            .store
            .get_plan_execution(plan_execution_id)
            .await?
            .ok_or_else(|| PlexusError::PlanExecutionNotFound(plan_execution_id.to_string()))?;
        Ok(plan.status.is_final().then_some(plan.status))
    }

    pub fn graph(&self, plan_execution_id: &str) -> Option<ExecutionGraph> {
        self.inner.graphs.snapshot(plan_execution_id)
    }

    /// Every node execution of the plan execution, including superseded attempts.
    pub async fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.inner
            .store
            .find_by_plan_execution(plan_execution_id, vec![])
            .await
    }

    pub async fn node_execution(&self, node_execution_id: &str) -> Result<Option<NodeExecution>> {
        self.inner.store.get(node_execution_id).await
    }

    pub async fn plan_execution(&self, plan_execution_id: &str) -> Result<Option<PlanExecution>> {
        self.inner.store.get_plan_execution(plan_execution_id).await
    }

    /// Correlation ids a suspended node is still waiting on.
    pub async fn pending_callbacks(&self, node_execution_id: &str) -> Vec<String> {
        self.inner.waits.pending(node_execution_id).await
    }

    /// Out-of-band responses held for waits that are not registered yet.
    pub async fn buffered_responses(&self) -> usize {
        self.inner.waits.buffered().await
    }

    /// Plan executions the engine still holds in memory.
    pub fn active_plan_executions(&self) -> usize {
        self.inner.plans.read().map(|plans| plans.len()).unwrap_or(0)
    }

    pub fn outcomes(&self) -> Arc<OutcomeService> {
        self.inner.outcomes.clone()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.event_bus.clone()
    }

    pub fn step_types(&self) -> Vec<&str> {
        self.inner.steps.list()
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Job>, cancel: CancellationToken) {
        info!(
            workers = self.permits.available_permits(),
            modes = ?self.strategies.modes(),
            "Orchestration engine started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Orchestration engine stopping");
                    break;
                }
                job = receiver.recv() => {
                    let Some(job) = job else { break };
                    let Ok(permit) = self.permits.clone().acquire_owned().await else { break };
                    let inner = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        inner.handle(job).await;
                    });
                }
            }
        }
    }

    async fn handle(&self, job: Job) {
        let node_execution_id = job.node_execution_id().to_string();
        let result = match job {
            Job::Start { node_execution_id } => self.run_node(&node_execution_id).await,
            Job::Resume {
                node_execution_id,
                responses,
            } => self.resume_node(&node_execution_id, responses).await,
            Job::Intervene {
                node_execution_id,
                action,
                expired,
            } => self.intervene(&node_execution_id, action, expired).await,
        };
        match result {
            Ok(()) => {}
            Err(PlexusError::Cancelled) => {
                debug!(node_execution_id = %node_execution_id, "Discontinued while running");
                if let Err(e) = self.finish_aborted(&node_execution_id).await {
                    error!(node_execution_id = %node_execution_id, error = %e, "Failed to finish aborted node");
                }
            }
            Err(e) => {
                error!(node_execution_id = %node_execution_id, error = %e, "Node execution errored");
                if let Err(e) = self.error_node(&node_execution_id, &e).await {
                    error!(node_execution_id = %node_execution_id, error = %e, "Failed to record node error");
                }
            }
        }
    }

    fn enqueue(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("Worker loop is gone, job dropped");
        }
    }

    /// Enqueue `job` after `delay` on a detached timer.
    fn schedule(&self, job: Job, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(job);
            return;
        }
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = jobs.send(job);
        });
    }

    fn plan(&self, plan_execution_id: &str) -> Result<Arc<Plan>> {
        self.plans
            .read()
            .map_err(|_| PlexusError::InvalidRequest("plan table poisoned".into()))?
            .get(plan_execution_id)
            .cloned()
            .ok_or_else(|| PlexusError::PlanExecutionNotFound(plan_execution_id.to_string()))
    }

    async fn get_node(&self, node_execution_id: &str) -> Result<NodeExecution> {
        self.store
            .get(node_execution_id)
            .await?
            .ok_or_else(|| PlexusError::NodeExecutionNotFound(node_execution_id.to_string()))
    }

    /// CAS update that reports status changes to the event bus and graph.
    async fn update_node<F>(&self, node_execution_id: &str, mut mutate: F) -> Result<NodeExecution>
    where
        F: FnMut(&mut NodeExecution) -> Result<()> + Send,
    {
        let mut before = None;
        let updated = update_node_execution(
            self.store.as_ref(),
            node_execution_id,
            &self.update_policy,
            |node| {
                before = Some(node.status);
                mutate(node)
            },
        )
        .await?;

        if let Some(from) = before.filter(|from| *from != updated.status) {
            debug!(
                node_execution_id = %node_execution_id,
                from = ?from,
                to = ?updated.status,
                "Node status changed"
            );
            self.event_bus.publish(OrchestrationEvent::NodeStatusChanged {
                plan_execution_id: updated.plan_execution_id.clone(),
                node_execution_id: updated.uuid.clone(),
                from,
                to: updated.status,
            });
        }
        self.graphs.on_updated(&updated);
        if updated.status.is_final() {
            self.release_if_settled(&updated.plan_execution_id).await;
        }
        Ok(updated)
    }

    /// Drop the in-memory state of a plan execution once it is final and
    /// none of its nodes can reach the engine again. The graph moves to the
    /// retained set.
    pub(super) async fn release_if_settled(&self, plan_execution_id: &str) {
        let tracked = self
            .plans
            .read()
            .map(|plans| plans.contains_key(plan_execution_id))
            .unwrap_or(false);
        if !tracked {
            return;
        }
        match self.is_settled(plan_execution_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(plan_execution_id = %plan_execution_id, error = %e, "Could not check plan execution for release");
                return;
            }
        }

        let released = self
            .plans
            .write()
            .map(|mut plans| plans.remove(plan_execution_id).is_some())
            .unwrap_or(false);
        if released {
            self.graphs.retire(plan_execution_id);
            debug!(plan_execution_id = %plan_execution_id, "Plan execution released");
        }
    }

    async fn is_settled(&self, plan_execution_id: &str) -> Result<bool> {
        let finished = self
            .store
            .get_plan_execution(plan_execution_id)
            .await?
            .is_some_and(|plan| plan.status.is_final());
        if !finished {
            return Ok(false);
        }
        Ok(self.store.non_final_statuses(plan_execution_id).await?.is_empty())
    }

    /// Move to `to` unless already there.
    async fn transition(&self, node_execution_id: &str, to: Status) -> Result<NodeExecution> {
        self.update_node(node_execution_id, |n| {
            if n.status == to {
                return Ok(());
            }
            n.transition(to)
        })
        .await
    }

    async fn notify(&self, correlation_id: &str, data: ResponseData) {
        if let Some((waiter, responses)) = self.waits.notify(correlation_id, data).await {
            debug!(node_execution_id = %waiter, responses = responses.len(), "Node ready to resume");
            self.enqueue(Job::Resume {
                node_execution_id: waiter,
                responses,
            });
        }
    }
}

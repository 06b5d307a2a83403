use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, Semaphore};
use tracing::info;

use plexus_core::config::{AppConfig, StoreBackend};
use plexus_core::error::Result;
use plexus_core::event::EventBus;
use plexus_core::traits::{NodeExecutionStore, OutcomeStore, Step, TaskDispatcher};
use plexus_store::{MemoryStore, SqliteStore};

use crate::advisor::{Adviser, AdviserRegistry};
use crate::backoff::RetryPolicy;
use crate::expression::ExpressionRenderer;
use crate::graph::GraphService;
use crate::lock::LockManager;
use crate::outcome::OutcomeService;
use crate::registry::StepRegistry;
use crate::resume::ResumeCoordinator;
use crate::retry_helper::RetryExecutionHelper;
use crate::strategy::{InvocationStrategy, StrategyRegistry};
use crate::wait::WaitRegistry;

use super::{Inner, OrchestrationEngine};

/// Attempts a resume makes to take a node's lock from a concurrent resume.
const RESUME_LOCK_ATTEMPTS: u32 = 50;

/// Builds an [`OrchestrationEngine`]. Stores default to the configured
/// backend; with neither stores nor config, everything lives in memory.
#[derive(Default)]
pub struct EngineBuilder {
    config: AppConfig,
    node_store: Option<Arc<dyn NodeExecutionStore>>,
    outcome_store: Option<Arc<dyn OutcomeStore>>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    event_bus: Option<Arc<EventBus>>,
    steps: StepRegistry,
    extra_advisers: Vec<Arc<dyn Adviser>>,
    extra_strategies: Vec<Arc<dyn InvocationStrategy>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_node_store(mut self, store: Arc<dyn NodeExecutionStore>) -> Self {
        self.node_store = Some(store);
        self
    }

    pub fn with_outcome_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.outcome_store = Some(store);
        self
    }

    /// Enables the task execution modes.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.register(step);
        self
    }

    /// Add or replace an adviser; built-ins stay registered.
    pub fn with_adviser(mut self, adviser: Arc<dyn Adviser>) -> Self {
        self.extra_advisers.push(adviser);
        self
    }

    /// Add or replace the strategy for every mode it declares.
    pub fn with_strategy(mut self, strategy: Arc<dyn InvocationStrategy>) -> Self {
        self.extra_strategies.push(strategy);
        self
    }

    fn default_stores(&self) -> Result<(Arc<dyn NodeExecutionStore>, Arc<dyn OutcomeStore>)> {
        match self.config.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                let nodes: Arc<dyn NodeExecutionStore> = store.clone();
                let outcomes: Arc<dyn OutcomeStore> = store;
                Ok((nodes, outcomes))
            }
            StoreBackend::Sqlite => {
                let path = self.config.store.resolved_path();
                info!(path = %path.display(), "Opening SQLite store");
                let store = Arc::new(SqliteStore::open(&path)?);
                let nodes: Arc<dyn NodeExecutionStore> = store.clone();
                let outcomes: Arc<dyn OutcomeStore> = store;
                Ok((nodes, outcomes))
            }
        }
    }

    pub fn build(self) -> Result<OrchestrationEngine> {
        let (node_store, outcome_store) = match (self.node_store.clone(), self.outcome_store.clone()) {
            (Some(nodes), Some(outcomes)) => (nodes, outcomes),
            (nodes, outcomes) => {
                let (default_nodes, default_outcomes) = self.default_stores()?;
                (
                    nodes.unwrap_or(default_nodes),
                    outcomes.unwrap_or(default_outcomes),
                )
            }
        };

        let engine_config = &self.config.engine;
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(engine_config.event_bus_capacity)));
        let update_policy = RetryPolicy::from(engine_config.update_retry);
        let dispatch_policy = RetryPolicy::from(engine_config.dispatch_retry);
        let lock_policy = RetryPolicy::new(RESUME_LOCK_ATTEMPTS, update_policy.delay);

        let outcomes = Arc::new(OutcomeService::new(
            outcome_store,
            self.config.outcomes.duplicate_policy,
            event_bus.clone(),
        ));
        let locks = Arc::new(LockManager::new(self.config.locks.ttl()));

        let mut strategies = StrategyRegistry::with_defaults(self.dispatcher, dispatch_policy)?;
        for strategy in self.extra_strategies {
            for mode in strategy.modes().to_vec() {
                strategies.register(mode, strategy.clone())?;
            }
        }
        let mut advisers = AdviserRegistry::with_defaults();
        for adviser in self.extra_advisers {
            advisers.register(adviser);
        }

        let (jobs, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            renderer: ExpressionRenderer::new(outcomes.clone())?,
            resume: ResumeCoordinator::new(node_store.clone(), outcomes.clone()),
            retry_helper: RetryExecutionHelper::new(
                node_store.clone(),
                locks.clone(),
                update_policy,
                event_bus.clone(),
            ),
            store: node_store,
            outcomes,
            steps: self.steps,
            strategies,
            advisers,
            waits: WaitRegistry::with_capacity(engine_config.max_buffered_responses),
            locks,
            graphs: GraphService::with_retention(engine_config.retained_graphs),
            event_bus,
            plans: RwLock::new(HashMap::new()),
            jobs,
            receiver: Mutex::new(Some(receiver)),
            permits: Arc::new(Semaphore::new(engine_config.max_concurrent_nodes.max(1))),
            update_policy,
            lock_policy,
        };
        Ok(OrchestrationEngine {
            inner: Arc::new(inner),
        })
    }
}

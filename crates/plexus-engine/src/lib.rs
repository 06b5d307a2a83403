pub mod advisor;
pub mod backoff;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod lock;
pub mod outcome;
pub mod registry;
pub mod resume;
pub mod retry_helper;
pub mod strategy;
pub mod wait;

pub use advisor::{AdviseChain, Adviser, AdviserRegistry, AdvisingEvent};
pub use backoff::RetryPolicy;
pub use engine::{EngineBuilder, OrchestrationEngine};
pub use expression::ExpressionRenderer;
pub use graph::{ExecutionGraph, GraphService, GraphVertex};
pub use lock::{LockGuard, LockManager};
pub use outcome::OutcomeService;
pub use registry::StepRegistry;
pub use resume::ResumeCoordinator;
pub use retry_helper::RetryExecutionHelper;
pub use strategy::{InvocationStrategy, StrategyOutcome, StrategyRegistry};
pub use wait::WaitRegistry;

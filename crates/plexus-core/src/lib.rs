pub mod advise;
pub mod ambiance;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod outcome;
pub mod plan;
pub mod step;
pub mod traits;
pub mod types;

pub use advise::{Advise, InterventionAction, RepairActionCode};
pub use ambiance::{Ambiance, Level};
pub use config::AppConfig;
pub use error::{PlexusError, Result};
pub use event::{EventBus, OrchestrationEvent};
pub use execution::{ExecutableResponse, NodeExecution, PlanExecution};
pub use outcome::{OutcomeInstance, RefObject};
pub use plan::{Plan, PlanNode};
pub use types::*;

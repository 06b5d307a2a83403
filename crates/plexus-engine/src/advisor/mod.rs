//! Advisers turn a node's terminal status and failure classification into
//! the next action.
//!
//! A plan node lists adviser obtainments in priority order; the chain asks
//! each adviser in turn and the first one that both can advise and does
//! advise wins. No advice means the status stands and propagates upward.

mod failure;
mod next_step;
mod retry;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use plexus_core::advise::Advise;
use plexus_core::ambiance::Ambiance;
use plexus_core::error::{PlexusError, Result};
use plexus_core::plan::{AdviserObtainment, AdviserType};
use plexus_core::types::{FailureInfo, FailureType, Status};

pub use failure::{AbortAdviser, IgnoreAdviser, ManualInterventionAdviser, MarkSuccessAdviser};
pub use next_step::{NextStepAdviser, OnFailAdviser, OnSuccessAdviser};
pub use retry::{wait_interval, RetryAdviser, RetryAdviserParameters};

/// What an adviser sees about a node that just reached `to_status`.
#[derive(Debug, Clone)]
pub struct AdvisingEvent {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub failure_info: Option<FailureInfo>,
    pub is_previous_adviser_expired: bool,
    /// Superseded attempts of this node, most recent first.
    pub retry_ids: Vec<String>,
    /// Parameters of the obtainment being evaluated.
    pub adviser_parameters: serde_json::Value,
    pub from_status: Status,
    pub to_status: Status,
}

impl AdvisingEvent {
    /// Reported failure types; `{UnknownFailure}` when nothing was reported.
    pub fn failure_types(&self) -> BTreeSet<FailureType> {
        self.failure_info
            .as_ref()
            .map(FailureInfo::effective_failure_types)
            .unwrap_or_else(|| BTreeSet::from([FailureType::UnknownFailure]))
    }

    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    /// Decode the obtainment parameters; a null or missing value decodes
    /// from an empty object.
    pub fn parameters<T: DeserializeOwned>(&self) -> Result<T> {
        let value = match &self.adviser_parameters {
            serde_json::Value::Null => serde_json::json!({}),
            v => v.clone(),
        };
        serde_json::from_value(value).map_err(|e| {
            PlexusError::InvalidRequest(format!(
                "bad adviser parameters for {}: {e}",
                self.node_execution_id
            ))
        })
    }
}

/// A policy turning a node outcome into an `Advise`.
pub trait Adviser: Send + Sync + 'static {
    fn adviser_type(&self) -> AdviserType;

    /// Cheap applicability check. Errors only on malformed parameters.
    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool>;

    /// `Ok(None)` defers to the next adviser in the chain.
    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>>;
}

/// True when `applicable` is empty or shares a type with the event.
pub(crate) fn failure_types_match(applicable: &BTreeSet<FailureType>, event: &AdvisingEvent) -> bool {
    applicable.is_empty() || !applicable.is_disjoint(&event.failure_types())
}

/// All advisers by type, built once at startup.
pub struct AdviserRegistry {
    advisers: HashMap<AdviserType, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn empty() -> Self {
        Self {
            advisers: HashMap::new(),
        }
    }

    /// Registry with every built-in adviser.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RetryAdviser));
        registry.register(Arc::new(OnSuccessAdviser));
        registry.register(Arc::new(OnFailAdviser));
        registry.register(Arc::new(NextStepAdviser));
        registry.register(Arc::new(IgnoreAdviser));
        registry.register(Arc::new(AbortAdviser));
        registry.register(Arc::new(MarkSuccessAdviser));
        registry.register(Arc::new(ManualInterventionAdviser));
        registry
    }

    pub fn register(&mut self, adviser: Arc<dyn Adviser>) {
        self.advisers.insert(adviser.adviser_type(), adviser);
    }

    pub fn get(&self, adviser_type: AdviserType) -> Result<Arc<dyn Adviser>> {
        self.advisers
            .get(&adviser_type)
            .cloned()
            .ok_or_else(|| PlexusError::InvalidRequest(format!("no adviser registered for {adviser_type:?}")))
    }

    pub fn chain<'a>(&'a self, obtainments: &'a [AdviserObtainment]) -> AdviseChain<'a> {
        AdviseChain {
            registry: self,
            obtainments,
        }
    }
}

/// The advisers of one plan node, in priority order.
pub struct AdviseChain<'a> {
    registry: &'a AdviserRegistry,
    obtainments: &'a [AdviserObtainment],
}

impl AdviseChain<'_> {
    pub fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        for obtainment in self.obtainments {
            let adviser = self.registry.get(obtainment.adviser_type)?;
            let event = AdvisingEvent {
                adviser_parameters: obtainment.parameters.clone(),
                ..event.clone()
            };
            if !adviser.can_advise(&event)? {
                continue;
            }
            if let Some(advise) = adviser.on_advise_event(&event)? {
                tracing::debug!(
                    node_execution_id = %event.node_execution_id,
                    adviser = ?obtainment.adviser_type,
                    advise = advise.kind(),
                    "Adviser claimed node"
                );
                return Ok(Some(advise));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use plexus_test_utils::ambiance_fixture;

    pub fn event(to_status: Status, failure: Option<FailureInfo>, params: serde_json::Value) -> AdvisingEvent {
        AdvisingEvent {
            ambiance: ambiance_fixture(),
            node_execution_id: "step-rt".into(),
            failure_info: failure,
            is_previous_adviser_expired: false,
            retry_ids: vec![],
            adviser_parameters: params,
            from_status: Status::Running,
            to_status,
        }
    }
}

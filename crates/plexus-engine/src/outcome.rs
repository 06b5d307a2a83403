use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use plexus_core::ambiance::Ambiance;
use plexus_core::config::DuplicatePolicy;
use plexus_core::error::{PlexusError, Result};
use plexus_core::event::{EventBus, OrchestrationEvent};
use plexus_core::outcome::{OutcomeInstance, RefObject};
use plexus_core::traits::OutcomeStore;
use plexus_core::types::generate_id;

/// Publishes and resolves named outcomes within a plan execution.
/// Outcomes are immutable; a second publish under the same key follows
/// the configured `DuplicatePolicy`.
pub struct OutcomeService {
    store: Arc<dyn OutcomeStore>,
    policy: DuplicatePolicy,
    event_bus: Arc<EventBus>,
}

impl OutcomeService {
    pub fn new(store: Arc<dyn OutcomeStore>, policy: DuplicatePolicy, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            policy,
            event_bus,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Publish `value` as `name` from the node the ambiance points at.
    /// With a `group` the outcome is scoped to the deepest level of that
    /// group instead of the producer. Returns the storage key.
    pub async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: serde_json::Value,
        group: Option<&str>,
    ) -> Result<String> {
        let producer = ambiance
            .current_runtime_id()
            .ok_or_else(|| PlexusError::InvalidRequest("outcome published outside a node".into()))?
            .to_string();
        let scope = match group {
            Some(group) => ambiance
                .level_for_group(group)
                .map(|l| l.runtime_id.clone())
                .ok_or_else(|| {
                    PlexusError::InvalidRequest(format!("no level in group '{group}' for outcome '{name}'"))
                })?,
            None => producer.clone(),
        };

        let outcome = OutcomeInstance {
            uuid: generate_id(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            producer_runtime_id: producer.clone(),
            scope_runtime_id: scope,
            name: name.to_string(),
            group: group.map(str::to_string),
            value,
            created_at: Utc::now(),
        };
        let uuid = outcome.uuid.clone();
        self.store
            .insert(outcome, self.policy == DuplicatePolicy::Reject)
            .await?;

        debug!(name = %name, producer = %producer, outcome_id = %uuid, "Outcome published");
        self.event_bus.publish(OrchestrationEvent::OutcomeConsumed {
            plan_execution_id: ambiance.plan_execution_id.clone(),
            producer_runtime_id: producer,
            name: name.to_string(),
        });
        Ok(uuid)
    }

    /// Look up an outcome visible from `ambiance`. A pinned reference is
    /// read directly; otherwise levels are searched from the current one
    /// up to the root. Absence is `Ok(None)`.
    pub async fn resolve(
        &self,
        ambiance: &Ambiance,
        reference: &RefObject,
    ) -> Result<Option<serde_json::Value>> {
        if let Some(producer_id) = &reference.producer_id {
            let found = self.store.get(producer_id).await?;
            return Ok(found
                .filter(|o| {
                    o.name == reference.name && o.plan_execution_id == ambiance.plan_execution_id
                })
                .map(|o| o.value));
        }

        for level in ambiance.levels.iter().rev() {
            if let Some(outcome) = self
                .store
                .find_latest(&ambiance.plan_execution_id, &level.runtime_id, &reference.name)
                .await?
            {
                return Ok(Some(outcome.value));
            }
        }
        Ok(None)
    }

    pub async fn fetch_outcome(&self, id: &str) -> Result<OutcomeInstance> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PlexusError::OutcomeNotFound(id.to_string()))
    }

    /// All of `ids`, in the order given. Any missing id fails the lookup.
    pub async fn fetch_outcomes(&self, ids: &[String]) -> Result<Vec<OutcomeInstance>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut found = self.store.get_many(ids.to_vec()).await?;
        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
            let pos = found
                .iter()
                .position(|o| &o.uuid == id)
                .ok_or_else(|| PlexusError::OutcomeNotFound(id.clone()))?;
            ordered.push(found.swap_remove(pos));
        }
        Ok(ordered)
    }

    pub async fn find_all_by_runtime_id(
        &self,
        plan_execution_id: &str,
        runtime_id: &str,
    ) -> Result<Vec<OutcomeInstance>> {
        self.store
            .find_all_by_runtime_id(plan_execution_id, runtime_id)
            .await
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::Utc;
use futures::future::BoxFuture;

use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::{NodeExecution, PlanExecution};
use plexus_core::outcome::OutcomeInstance;
use plexus_core::traits::{NodeExecutionStore, OutcomeStore};
use plexus_core::types::Status;

#[derive(Default)]
struct Nodes {
    /// uuid -> (insertion sequence, record)
    by_id: HashMap<String, (u64, NodeExecution)>,
    next_seq: u64,
}

impl Nodes {
    fn sorted<'a>(&'a self, filter: impl Fn(&NodeExecution) -> bool) -> Vec<NodeExecution> {
        let mut matched: Vec<&'a (u64, NodeExecution)> =
            self.by_id.values().filter(|(_, n)| filter(n)).collect();
        matched.sort_by_key(|(seq, _)| *seq);
        matched.into_iter().map(|(_, n)| n.clone()).collect()
    }
}

/// Process-local store backed by `RwLock`ed maps.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<Nodes>,
    plans: RwLock<HashMap<String, PlanExecution>>,
    // Insertion order doubles as recency for shadowed outcomes.
    outcomes: RwLock<Vec<OutcomeInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> PlexusError {
    PlexusError::Database(e.to_string())
}

impl NodeExecutionStore for MemoryStore {
    fn save(&self, node: NodeExecution) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut nodes = self.nodes.write().map_err(poisoned)?;
            if nodes.by_id.contains_key(&node.uuid) {
                return Err(PlexusError::DuplicateNodeExecution(node.uuid));
            }
            let seq = nodes.next_seq;
            nodes.next_seq += 1;
            nodes.by_id.insert(node.uuid.clone(), (seq, node));
            Ok(())
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<NodeExecution>>> {
        let id = id.to_string();
        Box::pin(async move {
            let nodes = self.nodes.read().map_err(poisoned)?;
            Ok(nodes.by_id.get(&id).map(|(_, n)| n.clone()))
        })
    }

    fn replace(&self, mut node: NodeExecution) -> BoxFuture<'_, Result<NodeExecution>> {
        Box::pin(async move {
            let mut nodes = self.nodes.write().map_err(poisoned)?;
            let Some((_, stored)) = nodes.by_id.get_mut(&node.uuid) else {
                return Err(PlexusError::NodeExecutionNotFound(node.uuid));
            };
            if stored.version != node.version {
                return Err(PlexusError::VersionConflict {
                    id: node.uuid,
                    expected: node.version,
                });
            }
            node.version += 1;
            node.last_updated_at = Utc::now();
            *stored = node.clone();
            Ok(node)
        })
    }

    fn find_children(
        &self,
        parent_id: &str,
        include_old_retries: bool,
    ) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let parent_id = parent_id.to_string();
        Box::pin(async move {
            let nodes = self.nodes.read().map_err(poisoned)?;
            Ok(nodes.sorted(|n| {
                n.parent_id.as_deref() == Some(parent_id.as_str())
                    && (include_old_retries || !n.old_retry)
            }))
        })
    }

    fn find_by_plan_execution(
        &self,
        plan_execution_id: &str,
        statuses: Vec<Status>,
    ) -> BoxFuture<'_, Result<Vec<NodeExecution>>> {
        let plan_execution_id = plan_execution_id.to_string();
        Box::pin(async move {
            let nodes = self.nodes.read().map_err(poisoned)?;
            Ok(nodes.sorted(|n| {
                n.plan_execution_id == plan_execution_id
                    && (statuses.is_empty() || statuses.contains(&n.status))
            }))
        })
    }

    fn relink_previous_id(&self, old_id: &str, new_id: &str) -> BoxFuture<'_, Result<usize>> {
        let old_id = old_id.to_string();
        let new_id = new_id.to_string();
        Box::pin(async move {
            let mut nodes = self.nodes.write().map_err(poisoned)?;
            let mut changed = 0;
            for (_, node) in nodes.by_id.values_mut() {
                // The retry copy itself carries the old attempt's previous_id, not its id.
                if node.uuid != new_id && node.previous_id.as_deref() == Some(old_id.as_str()) {
                    node.previous_id = Some(new_id.clone());
                    node.version += 1;
                    node.last_updated_at = Utc::now();
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    fn mark_old_retry(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut nodes = self.nodes.write().map_err(poisoned)?;
            let Some((_, node)) = nodes.by_id.get_mut(&id) else {
                return Ok(false);
            };
            if node.old_retry {
                return Ok(false);
            }
            node.old_retry = true;
            node.version += 1;
            node.last_updated_at = Utc::now();
            Ok(true)
        })
    }

    fn count_children_with_status(
        &self,
        parent_id: &str,
        statuses: Vec<Status>,
    ) -> BoxFuture<'_, Result<usize>> {
        let parent_id = parent_id.to_string();
        Box::pin(async move {
            let nodes = self.nodes.read().map_err(poisoned)?;
            Ok(nodes
                .by_id
                .values()
                .filter(|(_, n)| {
                    n.parent_id.as_deref() == Some(parent_id.as_str())
                        && !n.old_retry
                        && statuses.contains(&n.status)
                })
                .count())
        })
    }

    fn error_out_active_nodes(&self, plan_execution_id: &str) -> BoxFuture<'_, Result<usize>> {
        let plan_execution_id = plan_execution_id.to_string();
        Box::pin(async move {
            let mut nodes = self.nodes.write().map_err(poisoned)?;
            let now = Utc::now();
            let mut changed = 0;
            for (_, node) in nodes.by_id.values_mut() {
                if node.plan_execution_id == plan_execution_id && !node.status.is_final() {
                    node.status = Status::Errored;
                    node.end_ts = Some(now);
                    node.version += 1;
                    node.last_updated_at = now;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    fn non_final_statuses(
        &self,
        plan_execution_id: &str,
    ) -> BoxFuture<'_, Result<BTreeSet<Status>>> {
        let plan_execution_id = plan_execution_id.to_string();
        Box::pin(async move {
            let nodes = self.nodes.read().map_err(poisoned)?;
            Ok(nodes
                .by_id
                .values()
                .filter(|(_, n)| n.plan_execution_id == plan_execution_id && !n.status.is_final())
                .map(|(_, n)| n.status)
                .collect())
        })
    }

    fn save_plan_execution(&self, plan: PlanExecution) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut plans = self.plans.write().map_err(poisoned)?;
            if plans.contains_key(&plan.uuid) {
                return Err(PlexusError::InvalidRequest(format!(
                    "plan execution already exists: {}",
                    plan.uuid
                )));
            }
            plans.insert(plan.uuid.clone(), plan);
            Ok(())
        })
    }

    fn get_plan_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<PlanExecution>>> {
        let id = id.to_string();
        Box::pin(async move {
            let plans = self.plans.read().map_err(poisoned)?;
            Ok(plans.get(&id).cloned())
        })
    }

    fn replace_plan_execution(
        &self,
        mut plan: PlanExecution,
    ) -> BoxFuture<'_, Result<PlanExecution>> {
        Box::pin(async move {
            let mut plans = self.plans.write().map_err(poisoned)?;
            let Some(stored) = plans.get_mut(&plan.uuid) else {
                return Err(PlexusError::PlanExecutionNotFound(plan.uuid));
            };
            if stored.version != plan.version {
                return Err(PlexusError::VersionConflict {
                    id: plan.uuid,
                    expected: plan.version,
                });
            }
            plan.version += 1;
            *stored = plan.clone();
            Ok(plan)
        })
    }
}

impl OutcomeStore for MemoryStore {
    fn insert(
        &self,
        outcome: OutcomeInstance,
        enforce_unique_key: bool,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut outcomes = self.outcomes.write().map_err(poisoned)?;
            if enforce_unique_key && outcomes.iter().any(|o| o.key() == outcome.key()) {
                return Err(PlexusError::DuplicateOutcome {
                    plan_execution_id: outcome.plan_execution_id,
                    scope_runtime_id: outcome.scope_runtime_id,
                    name: outcome.name,
                });
            }
            outcomes.push(outcome);
            Ok(())
        })
    }

    fn get(&self, uuid: &str) -> BoxFuture<'_, Result<Option<OutcomeInstance>>> {
        let uuid = uuid.to_string();
        Box::pin(async move {
            let outcomes = self.outcomes.read().map_err(poisoned)?;
            Ok(outcomes.iter().find(|o| o.uuid == uuid).cloned())
        })
    }

    fn get_many(&self, uuids: Vec<String>) -> BoxFuture<'_, Result<Vec<OutcomeInstance>>> {
        Box::pin(async move {
            let outcomes = self.outcomes.read().map_err(poisoned)?;
            Ok(uuids
                .iter()
                .filter_map(|id| outcomes.iter().find(|o| &o.uuid == id).cloned())
                .collect())
        })
    }

    fn find_latest(
        &self,
        plan_execution_id: &str,
        scope_runtime_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<OutcomeInstance>>> {
        let plan_execution_id = plan_execution_id.to_string();
        let scope_runtime_id = scope_runtime_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let outcomes = self.outcomes.read().map_err(poisoned)?;
            Ok(outcomes
                .iter()
                .rev()
                .find(|o| {
                    o.plan_execution_id == plan_execution_id
                        && o.scope_runtime_id == scope_runtime_id
                        && o.name == name
                })
                .cloned())
        })
    }

    fn find_all_by_runtime_id(
        &self,
        plan_execution_id: &str,
        producer_runtime_id: &str,
    ) -> BoxFuture<'_, Result<Vec<OutcomeInstance>>> {
        let plan_execution_id = plan_execution_id.to_string();
        let producer_runtime_id = producer_runtime_id.to_string();
        Box::pin(async move {
            let outcomes = self.outcomes.read().map_err(poisoned)?;
            Ok(outcomes
                .iter()
                .filter(|o| {
                    o.plan_execution_id == plan_execution_id
                        && o.producer_runtime_id == producer_runtime_id
                })
                .cloned()
                .collect())
        })
    }
}

//! Per-plan-execution adjacency view of node executions, kept for
//! visualization. Vertices and edges are addressed by execution id only.

mod builder;
mod skipper;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use plexus_core::execution::NodeExecution;
use plexus_core::plan::SkipType;
use plexus_core::types::{ExecutionMode, FailureInfo, Status};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphVertex {
    pub uuid: String,
    pub node_id: String,
    pub identifier: String,
    pub name: String,
    pub step_type: String,
    pub status: Status,
    pub mode: ExecutionMode,
    pub retry_ids: Vec<String>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub failure_info: Option<FailureInfo>,
    pub skip_type: SkipType,
}

impl GraphVertex {
    pub fn from_node_execution(ne: &NodeExecution, skip_type: SkipType) -> Self {
        Self {
            uuid: ne.uuid.clone(),
            node_id: ne.node_id.clone(),
            identifier: ne.identifier.clone(),
            name: ne.name.clone(),
            step_type: ne.step_type.type_name.clone(),
            status: ne.status,
            mode: ne.mode,
            retry_ids: ne.retry_ids.clone(),
            start_ts: ne.start_ts,
            end_ts: ne.end_ts,
            failure_info: ne.failure_info.clone(),
            skip_type,
        }
    }
}

/// Edges of one vertex. `edges` lists the first child of each child chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EdgeList {
    pub prev_ids: Vec<String>,
    pub next_ids: Vec<String>,
    pub parent_id: Option<String>,
    pub edges: Vec<String>,
}

/// Where a skipped vertex stood, so later vertices that name it can be
/// attached to its surroundings instead.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Redirect {
    prev: Option<String>,
    parent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionGraph {
    pub root_ids: Vec<String>,
    pub adjacency: HashMap<String, EdgeList>,
    pub vertices: HashMap<String, GraphVertex>,
    #[serde(skip)]
    redirects: HashMap<String, Redirect>,
    /// Removed subtrees; anything created beneath them stays out of the graph.
    #[serde(skip)]
    hidden: HashSet<String>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex(&self, id: &str) -> Option<&GraphVertex> {
        self.vertices.get(id)
    }

    pub fn edges(&self, id: &str) -> Option<&EdgeList> {
        self.adjacency.get(id)
    }

    /// True if any edge list or the root set still names `id`.
    pub fn references(&self, id: &str) -> bool {
        self.root_ids.iter().any(|r| r == id)
            || self.adjacency.contains_key(id)
            || self.adjacency.values().any(|e| {
                e.prev_ids.iter().any(|x| x == id)
                    || e.next_ids.iter().any(|x| x == id)
                    || e.edges.iter().any(|x| x == id)
                    || e.parent_id.as_deref() == Some(id)
            })
    }

    /// Every vertex id reachable from the roots through child and sibling edges.
    pub fn reachable(&self) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = self.root_ids.clone();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(edges) = self.adjacency.get(&id) {
                stack.extend(edges.next_ids.iter().cloned());
                stack.extend(edges.edges.iter().cloned());
            }
        }
        seen
    }
}

/// Default number of finished execution graphs kept.
pub const DEFAULT_RETAINED_GRAPHS: usize = 32;

#[derive(Default)]
struct GraphTable {
    graphs: HashMap<String, ExecutionGraph>,
    /// Finished plan executions, oldest first.
    retired: VecDeque<String>,
}

/// One graph per plan execution, updated from engine status changes.
/// Graphs of finished executions are kept for the newest `retain` only.
pub struct GraphService {
    table: RwLock<GraphTable>,
    retain: usize,
}

impl Default for GraphService {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_GRAPHS)
    }
}

impl GraphService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain: usize) -> Self {
        Self {
            table: RwLock::new(GraphTable::default()),
            retain,
        }
    }

    fn with_table(&self, plan_execution_id: &str, f: impl FnOnce(&mut GraphTable)) {
        match self.table.write() {
            Ok(mut table) => f(&mut table),
            Err(_) => warn!(plan_execution_id = %plan_execution_id, "Graph lock poisoned, update dropped"),
        }
    }

    pub fn on_created(&self, ne: &NodeExecution, skip_type: SkipType) {
        self.with_table(&ne.plan_execution_id, |t| {
            t.graphs
                .entry(ne.plan_execution_id.clone())
                .or_default()
                .add_node_execution(ne, skip_type)
        });
    }

    pub fn on_updated(&self, ne: &NodeExecution) {
        self.with_table(&ne.plan_execution_id, |t| {
            if let Some(graph) = t.graphs.get_mut(&ne.plan_execution_id) {
                graph.update_status(ne);
            }
        });
    }

    pub fn on_retried(&self, old_id: &str, new_ne: &NodeExecution) {
        self.with_table(&new_ne.plan_execution_id, |t| {
            if let Some(graph) = t.graphs.get_mut(&new_ne.plan_execution_id) {
                graph.replace_retried(old_id, new_ne);
            }
        });
    }

    /// The plan execution finished: keep its graph among the retained ones,
    /// dropping the oldest past the limit.
    pub fn retire(&self, plan_execution_id: &str) {
        self.with_table(plan_execution_id, |t| {
            if !t.graphs.contains_key(plan_execution_id)
                || t.retired.iter().any(|id| id == plan_execution_id)
            {
                return;
            }
            t.retired.push_back(plan_execution_id.to_string());
            while t.retired.len() > self.retain {
                if let Some(oldest) = t.retired.pop_front() {
                    debug!(plan_execution_id = %oldest, "Execution graph dropped");
                    t.graphs.remove(&oldest);
                }
            }
        });
    }

    pub fn snapshot(&self, plan_execution_id: &str) -> Option<ExecutionGraph> {
        self.table
            .read()
            .ok()
            .and_then(|t| t.graphs.get(plan_execution_id).cloned())
    }

    /// Graphs currently held, live and retained.
    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.graphs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ne;
    use super::*;

    #[test]
    fn service_keeps_one_graph_per_plan_execution() {
        let service = GraphService::new();
        service.on_created(&ne("a", None, None), SkipType::NoOp);
        let mut other = ne("x", None, None);
        other.plan_execution_id = "pe-other".into();
        service.on_created(&other, SkipType::NoOp);

        let graph = service.snapshot("pe-graph").unwrap();
        assert_eq!(graph.root_ids, vec!["a".to_string()]);
        assert!(graph.vertex("x").is_none());
        assert_eq!(service.snapshot("pe-other").unwrap().root_ids, vec!["x".to_string()]);
        assert!(service.snapshot("pe-missing").is_none());
    }

    #[test]
    fn status_updates_reach_the_vertex() {
        let service = GraphService::new();
        let mut a = ne("a", None, None);
        service.on_created(&a, SkipType::NoOp);
        a.transition(Status::Running).unwrap();
        a.transition(Status::Succeeded).unwrap();
        service.on_updated(&a);

        let graph = service.snapshot("pe-graph").unwrap();
        let vertex = graph.vertex("a").unwrap();
        assert_eq!(vertex.status, Status::Succeeded);
        assert!(vertex.end_ts.is_some());
    }

    #[test]
    fn snapshot_serializes_without_internal_bookkeeping() {
        let service = GraphService::new();
        service.on_created(&ne("a", None, None), SkipType::SkipNode);
        let json = serde_json::to_value(service.snapshot("pe-graph").unwrap()).unwrap();
        assert!(json.get("redirects").is_none());
        assert!(json.get("hidden").is_none());
        assert_eq!(json["root_ids"], serde_json::json!([]));
    }

    #[test]
    fn retired_graphs_are_kept_up_to_the_limit() {
        let service = GraphService::with_retention(2);
        for pe in ["pe-1", "pe-2", "pe-3"] {
            let mut node = ne("a", None, None);
            node.plan_execution_id = pe.into();
            service.on_created(&node, SkipType::NoOp);
            service.retire(pe);
        }
        assert_eq!(service.len(), 2);
        assert!(service.snapshot("pe-1").is_none());
        assert!(service.snapshot("pe-3").is_some());

        // Updates for a dropped execution do not bring its graph back.
        let mut late = ne("a", None, None);
        late.plan_execution_id = "pe-1".into();
        service.on_updated(&late);
        assert!(service.snapshot("pe-1").is_none());
    }

    #[test]
    fn zero_retention_drops_graphs_on_retire() {
        let service = GraphService::with_retention(0);
        service.on_created(&ne("a", None, None), SkipType::NoOp);
        service.retire("pe-graph");
        assert!(service.is_empty());
    }
}

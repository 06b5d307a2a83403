use plexus_core::execution::NodeExecution;
use plexus_core::plan::SkipType;

use super::{EdgeList, ExecutionGraph, GraphVertex};

impl ExecutionGraph {
    /// Attach a newly created node execution, then apply its skip type.
    pub fn add_node_execution(&mut self, ne: &NodeExecution, skip_type: SkipType) {
        if self.adjacency.contains_key(&ne.uuid) || self.hidden.contains(&ne.uuid) {
            return;
        }
        if ne.parent_id.as_ref().is_some_and(|p| self.hidden.contains(p)) {
            self.hidden.insert(ne.uuid.clone());
            return;
        }

        let parent = self.resolve_parent(ne.parent_id.clone());
        let prev = self.resolve_prev(ne.previous_id.clone());
        self.attach(&ne.uuid, prev, parent);
        self.vertices
            .insert(ne.uuid.clone(), GraphVertex::from_node_execution(ne, skip_type));

        match skip_type {
            SkipType::NoOp => {}
            SkipType::SkipNode => self.skip_vertex(&ne.uuid),
            SkipType::SkipTree => self.remove_subtree(&ne.uuid),
        }
    }

    /// Refresh a vertex from the node execution's current state.
    pub fn update_status(&mut self, ne: &NodeExecution) {
        if let Some(vertex) = self.vertices.get_mut(&ne.uuid) {
            vertex.status = ne.status;
            vertex.start_ts = ne.start_ts;
            vertex.end_ts = ne.end_ts;
            vertex.failure_info = ne.failure_info.clone();
        }
    }

    /// Put the new attempt in the old attempt's place.
    pub fn replace_retried(&mut self, old_id: &str, new_ne: &NodeExecution) {
        let new_id = new_ne.uuid.as_str();
        if self.hidden.contains(old_id) {
            self.hidden.insert(new_id.to_string());
            return;
        }
        if let Some(redirect) = self.redirects.get(old_id).cloned() {
            self.redirects.insert(new_id.to_string(), redirect);
        }
        let Some(vertex) = self.vertices.remove(old_id) else {
            return;
        };

        let rename = |ids: &mut Vec<String>| {
            for id in ids.iter_mut() {
                if id == old_id {
                    *id = new_id.to_string();
                }
            }
        };
        rename(&mut self.root_ids);
        for edges in self.adjacency.values_mut() {
            rename(&mut edges.prev_ids);
            rename(&mut edges.next_ids);
            rename(&mut edges.edges);
            if edges.parent_id.as_deref() == Some(old_id) {
                edges.parent_id = Some(new_id.to_string());
            }
        }
        if let Some(edges) = self.adjacency.remove(old_id) {
            self.adjacency.insert(new_id.to_string(), edges);
        }
        self.vertices.insert(
            new_id.to_string(),
            GraphVertex::from_node_execution(new_ne, vertex.skip_type),
        );
    }

    fn resolve_parent(&self, mut parent: Option<String>) -> Option<String> {
        while let Some(p) = &parent {
            match self.redirects.get(p) {
                Some(redirect) => parent = redirect.parent.clone(),
                None => break,
            }
        }
        parent
    }

    fn resolve_prev(&self, mut prev: Option<String>) -> Option<String> {
        while let Some(p) = &prev {
            if let Some(redirect) = self.redirects.get(p) {
                prev = redirect.prev.clone();
            } else if !self.adjacency.contains_key(p) {
                prev = None;
            } else {
                break;
            }
        }
        prev
    }

    pub(super) fn attach(&mut self, id: &str, prev: Option<String>, parent: Option<String>) {
        let mut edges = EdgeList {
            parent_id: parent.clone(),
            ..EdgeList::default()
        };
        match (prev, parent) {
            (Some(prev), _) => {
                if let Some(prev_edges) = self.adjacency.get_mut(&prev) {
                    prev_edges.next_ids.push(id.to_string());
                }
                edges.prev_ids.push(prev);
            }
            (None, Some(parent)) => {
                self.adjacency
                    .entry(parent)
                    .or_default()
                    .edges
                    .push(id.to_string());
            }
            (None, None) => self.root_ids.push(id.to_string()),
        }
        self.adjacency.insert(id.to_string(), edges);
    }
}

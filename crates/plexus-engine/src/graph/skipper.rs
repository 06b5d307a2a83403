use std::collections::HashSet;

use tracing::debug;

use super::{ExecutionGraph, Redirect};

/// Replace `id` inside `list` with `with`, keeping position and dropping
/// duplicates already present.
fn splice(list: &mut Vec<String>, id: &str, with: &[String]) {
    let Some(pos) = list.iter().position(|x| x == id) else {
        return;
    };
    list.remove(pos);
    let mut at = pos;
    for w in with {
        if !list.contains(w) {
            list.insert(at, w.clone());
            at += 1;
        }
    }
}

impl ExecutionGraph {
    /// Elide a vertex while keeping everything around it reachable.
    pub fn skip_vertex(&mut self, id: &str) {
        let Some(skipped) = self.adjacency.remove(id) else {
            return;
        };
        self.vertices.remove(id);

        if !skipped.prev_ids.is_empty() {
            for prev in &skipped.prev_ids {
                if let Some(edges) = self.adjacency.get_mut(prev) {
                    splice(&mut edges.next_ids, id, &skipped.next_ids);
                }
            }
            let single_prev = match skipped.prev_ids.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            };
            for next in &skipped.next_ids {
                if let Some(edges) = self.adjacency.get_mut(next) {
                    edges.prev_ids.retain(|p| p != id);
                    if let Some(prev) = &single_prev {
                        if !edges.prev_ids.contains(prev) {
                            edges.prev_ids.push(prev.clone());
                        }
                    }
                }
            }
        } else if let Some(parent) = &skipped.parent_id {
            if let Some(edges) = self.adjacency.get_mut(parent) {
                splice(&mut edges.edges, id, &skipped.next_ids);
            }
            for next in &skipped.next_ids {
                if let Some(edges) = self.adjacency.get_mut(next) {
                    edges.prev_ids.retain(|p| p != id);
                    edges.parent_id = Some(parent.clone());
                }
            }
        } else {
            splice(&mut self.root_ids, id, &skipped.next_ids);
            for next in &skipped.next_ids {
                if let Some(edges) = self.adjacency.get_mut(next) {
                    edges.prev_ids.retain(|p| p != id);
                }
            }
        }

        // Children move up to the skipped vertex's parent.
        for child in &skipped.edges {
            match &skipped.parent_id {
                Some(parent) => {
                    if let Some(edges) = self.adjacency.get_mut(parent) {
                        if !edges.edges.contains(child) {
                            edges.edges.push(child.clone());
                        }
                    }
                }
                None => {
                    if !self.root_ids.contains(child) {
                        self.root_ids.push(child.clone());
                    }
                }
            }
        }
        for edges in self.adjacency.values_mut() {
            if edges.parent_id.as_deref() == Some(id) {
                edges.parent_id = skipped.parent_id.clone();
            }
        }

        self.redirects.insert(
            id.to_string(),
            Redirect {
                prev: skipped.prev_ids.first().cloned(),
                parent: skipped.parent_id.clone(),
            },
        );
        debug!(vertex = %id, "Vertex skipped");
    }

    /// Remove a vertex together with everything beneath it. Children created
    /// later under any removed vertex are kept out of the graph.
    pub fn remove_subtree(&mut self, id: &str) {
        let mut descendants = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for (child, edges) in &self.adjacency {
                if edges.parent_id.as_deref() == Some(current.as_str()) && descendants.insert(child.clone()) {
                    frontier.push(child.clone());
                }
            }
        }

        for d in &descendants {
            self.adjacency.remove(d);
            self.vertices.remove(d);
        }
        if let Some(edges) = self.adjacency.get_mut(id) {
            edges.edges.clear();
        }
        self.hidden.extend(descendants);
        self.skip_vertex(id);
        self.hidden.insert(id.to_string());
    }
}

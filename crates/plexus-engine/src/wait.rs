use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use plexus_core::step::{ResponseData, ResponseMap};

/// Default cap on buffered responses and on remembered settled ids.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

struct Waiter {
    pending: BTreeSet<String>,
    received: ResponseMap,
}

/// Insertion-ordered set that forgets its oldest entries past `capacity`.
#[derive(Default)]
struct RecentIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    fn insert(&mut self, id: String, capacity: usize) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|x| x != id);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

#[derive(Default)]
struct WaitState {
    waiters: HashMap<String, Waiter>,
    /// correlation id -> waiting node execution id
    by_correlation: HashMap<String, String>,
    /// Responses that arrived before anyone waited on them.
    early: HashMap<String, ResponseData>,
    early_order: VecDeque<String>,
    /// Correlation ids whose wait completed or was cancelled. Responses for
    /// them are dropped instead of buffered.
    settled: RecentIds,
}

impl WaitState {
    fn take_early(&mut self, id: &str) -> Option<ResponseData> {
        let data = self.early.remove(id)?;
        self.early_order.retain(|x| x != id);
        Some(data)
    }

    fn settle<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>, capacity: usize) {
        for id in ids {
            self.settled.insert(id.clone(), capacity);
        }
    }
}

/// Fan-in of out-of-band responses. A suspended node registers the
/// correlation ids it waits on; it becomes ready once all have arrived.
///
/// Responses nobody waits on yet are buffered, oldest dropped first past
/// the capacity. Responses for waits that already completed or were
/// cancelled are discarded.
pub struct WaitRegistry {
    state: Mutex<WaitState>,
    capacity: usize,
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(WaitState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Wait on `correlation_ids` for `waiter`. Returns the full response map
    /// right away if every response was already buffered.
    pub async fn register(
        &self,
        waiter: &str,
        correlation_ids: Vec<String>,
    ) -> Option<ResponseMap> {
        let mut state = self.state.lock().await;
        let mut entry = Waiter {
            pending: BTreeSet::new(),
            received: ResponseMap::new(),
        };
        for id in correlation_ids {
            state.settled.remove(&id);
            match state.take_early(&id) {
                Some(data) => {
                    entry.received.insert(id, data);
                }
                None => {
                    state.by_correlation.insert(id.clone(), waiter.to_string());
                    entry.pending.insert(id);
                }
            }
        }

        if entry.pending.is_empty() {
            debug!(waiter = %waiter, "All responses already buffered");
            state.settle(entry.received.keys(), self.capacity);
            return Some(entry.received);
        }
        state.waiters.insert(waiter.to_string(), entry);
        None
    }

    /// Deliver one response. Returns the waiter and its responses when this
    /// was the last one it was waiting for.
    pub async fn notify(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> Option<(String, ResponseMap)> {
        let mut state = self.state.lock().await;
        let Some(waiter_id) = state.by_correlation.remove(correlation_id) else {
            if state.settled.contains(correlation_id) {
                debug!(correlation_id = %correlation_id, "Wait already settled, response dropped");
                return None;
            }
            debug!(correlation_id = %correlation_id, "No waiter yet, buffering response");
            if state.early.insert(correlation_id.to_string(), data).is_none() {
                state.early_order.push_back(correlation_id.to_string());
            }
            while state.early_order.len() > self.capacity {
                if let Some(oldest) = state.early_order.pop_front() {
                    warn!(correlation_id = %oldest, "Response buffer full, dropping oldest");
                    state.early.remove(&oldest);
                }
            }
            return None;
        };

        let ready = match state.waiters.get_mut(&waiter_id) {
            Some(waiter) => {
                waiter.pending.remove(correlation_id);
                waiter.received.insert(correlation_id.to_string(), data);
                waiter.pending.is_empty()
            }
            None => false,
        };
        if !ready {
            return None;
        }
        let waiter = state.waiters.remove(&waiter_id)?;
        state.settle(waiter.received.keys(), self.capacity);
        Some((waiter_id, waiter.received))
    }

    /// Drop a waiter and everything it was waiting on. Returns true if it
    /// was registered.
    pub async fn cancel(&self, waiter: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.waiters.remove(waiter) {
            Some(entry) => {
                for id in &entry.pending {
                    state.by_correlation.remove(id);
                }
                state.settle(entry.pending.iter().chain(entry.received.keys()), self.capacity);
                true
            }
            None => false,
        }
    }

    /// Correlation ids `waiter` is still waiting on.
    pub async fn pending(&self, waiter: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .waiters
            .get(waiter)
            .map(|w| w.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_waiting(&self, waiter: &str) -> bool {
        self.state.lock().await.waiters.contains_key(waiter)
    }

    /// Responses held for waits not registered yet.
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.early.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callback(v: i64) -> ResponseData {
        ResponseData::Callback(json!({ "v": v }))
    }

    #[tokio::test]
    async fn ready_only_when_all_responses_arrived() {
        let waits = WaitRegistry::new();
        assert!(waits
            .register("parent", vec!["c1".into(), "c2".into()])
            .await
            .is_none());

        assert!(waits.notify("c1", callback(1)).await.is_none());
        assert_eq!(waits.pending("parent").await, vec!["c2".to_string()]);

        let (waiter, responses) = waits.notify("c2", callback(2)).await.unwrap();
        assert_eq!(waiter, "parent");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses["c1"], callback(1));
        assert!(!waits.is_waiting("parent").await);
    }

    #[tokio::test]
    async fn early_responses_are_buffered() {
        let waits = WaitRegistry::new();
        assert!(waits.notify("task-1", callback(7)).await.is_none());

        let responses = waits
            .register("node", vec!["task-1".into()])
            .await
            .unwrap();
        assert_eq!(responses["task-1"], callback(7));
        assert!(!waits.is_waiting("node").await);
    }

    #[tokio::test]
    async fn cancelled_waiter_no_longer_resumes() {
        let waits = WaitRegistry::new();
        waits.register("node", vec!["cb".into()]).await;
        assert!(waits.cancel("node").await);
        assert!(!waits.cancel("node").await);

        // Late response is neither routed nor kept.
        assert!(waits.notify("cb", callback(1)).await.is_none());
        assert!(!waits.is_waiting("node").await);
        assert_eq!(waits.buffered().await, 0);
    }

    #[tokio::test]
    async fn settled_waits_retain_nothing() {
        let waits = WaitRegistry::new();
        for i in 0..1000 {
            let cb = format!("cb-{i}");
            waits.register(&format!("node-{i}"), vec![cb.clone()]).await;
            waits.cancel(&format!("node-{i}")).await;
            assert!(waits.notify(&cb, callback(i)).await.is_none());
        }

        waits.register("task-node", vec!["task-1".into()]).await;
        assert!(waits.notify("task-1", callback(1)).await.is_some());
        // Duplicate delivery after the node already resumed.
        assert!(waits.notify("task-1", callback(1)).await.is_none());
        assert_eq!(waits.buffered().await, 0);
    }

    #[tokio::test]
    async fn buffer_drops_oldest_past_capacity() {
        let waits = WaitRegistry::with_capacity(2);
        for id in ["a", "b", "c"] {
            waits.notify(id, callback(1)).await;
        }
        assert_eq!(waits.buffered().await, 2);

        assert!(waits.register("late", vec!["a".into()]).await.is_none());
        assert!(waits.register("fresh", vec!["c".into()]).await.is_some());
        assert_eq!(waits.buffered().await, 1);
    }

    #[tokio::test]
    async fn reregistering_a_settled_id_waits_again() {
        let waits = WaitRegistry::new();
        waits.register("node", vec!["cb".into()]).await;
        waits.cancel("node").await;

        assert!(waits.register("node", vec!["cb".into()]).await.is_none());
        let (waiter, _) = waits.notify("cb", callback(2)).await.unwrap();
        assert_eq!(waiter, "node");
    }
}

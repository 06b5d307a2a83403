use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use plexus_core::error::{PlexusError, Result};
use plexus_core::step::TaskRequest;
use plexus_core::traits::TaskDispatcher;

/// `TaskDispatcher` that records submissions and hands out sequential
/// task ids. Can be told to fail the first N submissions transiently.
#[derive(Default)]
pub struct RecordingDispatcher {
    submitted: Mutex<Vec<(String, TaskRequest)>>,
    fail_first: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Successful submissions as (task id, request).
    pub fn submitted(&self) -> Vec<(String, TaskRequest)> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// All submission attempts, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Id of the most recent successful submission.
    pub fn last_task_id(&self) -> Option<String> {
        self.submitted().last().map(|(id, _)| id.clone())
    }
}

impl TaskDispatcher for RecordingDispatcher {
    fn submit(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first.load(Ordering::SeqCst) {
                return Err(PlexusError::TaskDispatch(format!(
                    "simulated outage on attempt {}",
                    attempt + 1
                )));
            }
            let mut submitted = self
                .submitted
                .lock()
                .map_err(|e| PlexusError::TaskDispatch(e.to_string()))?;
            let task_id = format!("task-{}", submitted.len() + 1);
            submitted.push((task_id.clone(), request));
            Ok(task_id)
        })
    }
}

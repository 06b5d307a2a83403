use std::future::Future;
use std::time::Duration;

use tracing::warn;

use plexus_core::config::RetryPolicyConfig;
use plexus_core::error::{PlexusError, Result};
use plexus_core::execution::{NodeExecution, PlanExecution};
use plexus_core::traits::NodeExecutionStore;

/// Fixed-delay retry policy: at most `max_attempts` tries, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl From<RetryPolicyConfig> for RetryPolicy {
    fn from(config: RetryPolicyConfig) -> Self {
        Self::new(config.max_attempts, config.delay())
    }
}

/// Run `op`, retrying transient errors (see `PlexusError::is_transient`).
/// Anything else is returned on the first occurrence.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    operation = what,
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read-modify-write of a node execution as a compare-and-swap loop.
/// `mutate` runs against a fresh copy on every attempt; an error from it
/// aborts the loop unchanged.
pub async fn update_node_execution<F>(
    store: &dyn NodeExecutionStore,
    id: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<NodeExecution>
where
    F: FnMut(&mut NodeExecution) -> Result<()> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let mut node = store
            .get(id)
            .await?
            .ok_or_else(|| PlexusError::NodeExecutionNotFound(id.to_string()))?;
        mutate(&mut node)?;
        node.last_updated_at = chrono::Utc::now();

        match store.replace(node).await {
            Ok(updated) => return Ok(updated),
            Err(PlexusError::VersionConflict { expected, .. }) => {
                warn!(
                    node_execution_id = %id,
                    attempt,
                    max_attempts,
                    expected_version = expected,
                    "Concurrent update, retrying"
                );
                if attempt < max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(PlexusError::ConcurrentUpdateExhausted {
        id: id.to_string(),
        attempts: max_attempts,
    })
}

/// Same loop for the plan execution record.
pub async fn update_plan_execution<F>(
    store: &dyn NodeExecutionStore,
    id: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<PlanExecution>
where
    F: FnMut(&mut PlanExecution) -> Result<()> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let mut plan = store
            .get_plan_execution(id)
            .await?
            .ok_or_else(|| PlexusError::PlanExecutionNotFound(id.to_string()))?;
        mutate(&mut plan)?;

        match store.replace_plan_execution(plan).await {
            Ok(updated) => return Ok(updated),
            Err(PlexusError::VersionConflict { .. }) => {
                warn!(plan_execution_id = %id, attempt, max_attempts, "Concurrent plan update, retrying");
                if attempt < max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(PlexusError::ConcurrentUpdateExhausted {
        id: id.to_string(),
        attempts: max_attempts,
    })
}

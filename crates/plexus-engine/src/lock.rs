use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use plexus_core::error::{PlexusError, Result};
use plexus_core::types::generate_id;

use crate::backoff::{with_retry, RetryPolicy};

struct Held {
    token: String,
    expires_at: Instant,
}

type LockTable = Arc<Mutex<HashMap<String, Held>>>;

/// In-process named locks with a TTL. An expired lock can be taken over,
/// so a holder that never releases only blocks others for `ttl`.
pub struct LockManager {
    ttl: Duration,
    table: LockTable,
}

impl LockManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take `key` now or fail with `LockHeld`.
    pub fn try_acquire(&self, key: &str) -> Result<LockGuard> {
        let mut table = self
            .table
            .lock()
            .map_err(|e| PlexusError::LockHeld(format!("{key}: {e}")))?;
        let now = Instant::now();
        if let Some(held) = table.get(key) {
            if held.expires_at > now {
                return Err(PlexusError::LockHeld(key.to_string()));
            }
            warn!(lock = %key, "Taking over expired lock");
        }
        let token = generate_id();
        table.insert(
            key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + self.ttl,
            },
        );
        debug!(lock = %key, "Lock acquired");
        Ok(LockGuard {
            table: self.table.clone(),
            key: key.to_string(),
            token,
        })
    }

    /// Take `key`, waiting out a busy holder according to `policy`.
    pub async fn acquire(&self, key: &str, policy: &RetryPolicy) -> Result<LockGuard> {
        with_retry(policy, "lock", || async { self.try_acquire(key) }).await
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.table
            .lock()
            .map(|t| t.get(key).is_some_and(|h| h.expires_at > Instant::now()))
            .unwrap_or(false)
    }
}

/// Releases the lock on drop, unless it already expired and was taken over.
pub struct LockGuard {
    table: LockTable,
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            if table.get(&self.key).is_some_and(|h| h.token == self.token) {
                table.remove(&self.key);
            }
        }
    }
}

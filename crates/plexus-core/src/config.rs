use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlexusError, Result};

/// Top-level Plexus configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub outcomes: OutcomeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size: node invocations running at once.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// Compare-and-swap loop for node execution updates.
    #[serde(default = "default_update_retry")]
    pub update_retry: RetryPolicyConfig,
    /// Transient failures submitting remote tasks.
    #[serde(default = "default_dispatch_retry")]
    pub dispatch_retry: RetryPolicyConfig,
    /// Execution graphs of finished plan executions kept for `graph()`,
    /// newest first. Older ones are dropped.
    #[serde(default = "default_retained_graphs")]
    pub retained_graphs: usize,
    /// Cap on responses buffered for waits not registered yet.
    #[serde(default = "default_max_buffered_responses")]
    pub max_buffered_responses: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            event_bus_capacity: default_event_bus_capacity(),
            update_retry: default_update_retry(),
            dispatch_retry: default_dispatch_retry(),
            retained_graphs: default_retained_graphs(),
            max_buffered_responses: default_max_buffered_responses(),
        }
    }
}

fn default_max_concurrent_nodes() -> usize { 64 }
fn default_event_bus_capacity() -> usize { 1024 }
fn default_update_retry() -> RetryPolicyConfig { RetryPolicyConfig { max_attempts: 5, delay_ms: 20 } }
fn default_dispatch_retry() -> RetryPolicyConfig { RetryPolicyConfig { max_attempts: 3, delay_ms: 200 } }
fn default_retained_graphs() -> usize { 32 }
fn default_max_buffered_responses() -> usize { 4096 }

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl RetryPolicyConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_delay_ms() -> u64 { 100 }

/// What happens when an outcome is published twice under the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Fail the second publish.
    #[default]
    Reject,
    /// Keep both; lookups return the newest.
    Shadow,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeConfig {
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "plexus.db".to_string() }

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl(),
        }
    }
}

fn default_lock_ttl() -> u64 { 30 }

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `plexus=debug,warn`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String { "plexus=info,warn".to_string() }

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PlexusError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| PlexusError::Config(e.to_string()))
    }

    /// Log filter from `[log]`, if configured.
    pub fn log_filter(&self) -> Option<&str> {
        self.log.as_ref().map(|l| l.filter.as_str())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

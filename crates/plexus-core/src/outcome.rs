use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named value published by a node, scoped to a runtime id (or the
/// runtime id of the enclosing group level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeInstance {
    pub uuid: String,
    pub plan_execution_id: String,
    /// Node execution that published the value.
    pub producer_runtime_id: String,
    /// Runtime id the value is visible under.
    pub scope_runtime_id: String,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OutcomeInstance {
    pub fn key(&self) -> OutcomeKey<'_> {
        OutcomeKey {
            plan_execution_id: &self.plan_execution_id,
            scope_runtime_id: &self.scope_runtime_id,
            name: &self.name,
        }
    }
}

/// Uniqueness key of an outcome.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct OutcomeKey<'a> {
    pub plan_execution_id: &'a str,
    pub scope_runtime_id: &'a str,
    pub name: &'a str,
}

/// Reference to an outcome by name, optionally pinned to a producer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefObject {
    pub name: String,
    #[serde(default)]
    pub producer_id: Option<String>,
}

impl RefObject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            producer_id: None,
        }
    }

    pub fn pinned(name: impl Into<String>, producer_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            producer_id: Some(producer_id.into()),
        }
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use plexus_core::ambiance::Ambiance;
use plexus_core::error::{PlexusError, Result};
use plexus_core::outcome::RefObject;

use crate::outcome::OutcomeService;

const OUTCOME_EXPRESSION: &str = r"<\+outcome\.([A-Za-z0-9_\-]+)((?:\.[A-Za-z0-9_\-]+)*)>";

/// Renders `<+outcome.NAME.path>` expressions in step parameters against
/// the outcomes visible from a node. Unresolvable expressions are left as
/// written.
pub struct ExpressionRenderer {
    outcomes: Arc<OutcomeService>,
    pattern: Regex,
}

impl ExpressionRenderer {
    pub fn new(outcomes: Arc<OutcomeService>) -> Result<Self> {
        let pattern = Regex::new(OUTCOME_EXPRESSION)
            .map_err(|e| PlexusError::InvalidRequest(format!("expression pattern: {e}")))?;
        Ok(Self { outcomes, pattern })
    }

    pub async fn render_value(&self, ambiance: &Ambiance, value: &Value) -> Result<Value> {
        let mut names = Vec::new();
        self.collect_names(value, &mut names);
        if names.is_empty() {
            return Ok(value.clone());
        }

        let mut resolved = BTreeMap::new();
        for name in names {
            if resolved.contains_key(&name) {
                continue;
            }
            let found = self
                .outcomes
                .resolve(ambiance, &RefObject::named(name.clone()))
                .await?;
            if found.is_none() {
                debug!(outcome = %name, "Expression left unresolved");
            }
            resolved.insert(name, found);
        }
        Ok(self.substitute(value, &resolved))
    }

    fn collect_names(&self, value: &Value, names: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                for caps in self.pattern.captures_iter(s) {
                    names.push(caps[1].to_string());
                }
            }
            Value::Array(items) => items.iter().for_each(|v| self.collect_names(v, names)),
            Value::Object(map) => map.values().for_each(|v| self.collect_names(v, names)),
            _ => {}
        }
    }

    fn substitute(&self, value: &Value, resolved: &BTreeMap<String, Option<Value>>) -> Value {
        match value {
            Value::String(s) => self.substitute_str(s, resolved),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.substitute(v, resolved)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute(v, resolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn substitute_str(&self, s: &str, resolved: &BTreeMap<String, Option<Value>>) -> Value {
        let lookup = |caps: &regex::Captures<'_>| -> Option<Value> {
            let root = resolved.get(&caps[1])?.as_ref()?;
            let path = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            navigate(root, path).cloned()
        };

        // A string that is exactly one expression takes the value's own type.
        if let Some(caps) = self.pattern.captures(s) {
            if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
                return lookup(&caps).unwrap_or_else(|| Value::String(s.to_string()));
            }
        }

        let rendered = self.pattern.replace_all(s, |caps: &regex::Captures<'_>| {
            match lookup(caps) {
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        });
        Value::String(rendered.into_owned())
    }
}

/// Follow a `.a.b.0` path into a JSON value.
fn navigate<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(root, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

use std::collections::HashMap;
use std::sync::Arc;

use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::Step;

/// Registry of step implementations by step type.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its own step type. A later registration
    /// replaces an earlier one.
    pub fn register(&mut self, step: Arc<dyn Step>) {
        let name = step.step_type().to_string();
        self.steps.insert(name, step);
    }

    pub fn get(&self, step_type: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(step_type)
            .cloned()
            .ok_or_else(|| PlexusError::StepNotRegistered(step_type.to_string()))
    }

    /// Registered step types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_test_utils::ScriptedStep;

    #[test]
    fn lookup_by_step_type() {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(ScriptedStep::sync("shell")));
        registry.register(Arc::new(ScriptedStep::sync("http")));

        assert_eq!(registry.get("shell").unwrap().step_type(), "shell");
        assert_eq!(registry.list(), vec!["http", "shell"]);
        assert!(matches!(
            registry.get("docker"),
            Err(PlexusError::StepNotRegistered(t)) if t == "docker"
        ));
    }
}

//! Shared test utilities for Plexus crates.

pub mod dispatch;
pub mod fixtures;
pub mod step;

pub use dispatch::RecordingDispatcher;
pub use fixtures::{ambiance_fixture, plan_node, setup_abstractions, temp_config, PlanBuilder};
pub use step::{Behaviour, ScriptedStep};

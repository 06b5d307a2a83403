use std::collections::BTreeSet;

use serde::Deserialize;

use plexus_core::advise::{Advise, RepairActionCode};
use plexus_core::error::Result;
use plexus_core::plan::AdviserType;
use plexus_core::types::FailureType;

use super::{failure_types_match, Adviser, AdvisingEvent};

#[derive(Debug, Clone, Default, Deserialize)]
struct FailureStrategyParameters {
    #[serde(default)]
    applicable_failure_types: BTreeSet<FailureType>,
    #[serde(default)]
    next_node_id: Option<String>,
}

fn applies(event: &AdvisingEvent) -> Result<Option<FailureStrategyParameters>> {
    if !event.to_status.is_broken() {
        return Ok(None);
    }
    let params: FailureStrategyParameters = event.parameters()?;
    Ok(failure_types_match(&params.applicable_failure_types, event).then_some(params))
}

/// Swallows a matching failure: the node becomes `IgnoreFailed` and the
/// branch continues.
pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::Ignore
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(applies(event)?.is_some())
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        Ok(applies(event)?.map(|p| Advise::Ignore {
            next_node_id: p.next_node_id,
        }))
    }
}

/// Aborts the whole plan execution on a matching failure.
pub struct AbortAdviser;

impl Adviser for AbortAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::Abort
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(applies(event)?.is_some())
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        Ok(applies(event)?.map(|_| Advise::Abort))
    }
}

/// Overrides a matching failure to `Succeeded`.
pub struct MarkSuccessAdviser;

impl Adviser for MarkSuccessAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::MarkSuccess
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(applies(event)?.is_some())
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        Ok(applies(event)?.map(|p| Advise::MarkSuccess {
            next_node_id: p.next_node_id,
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ManualInterventionParameters {
    #[serde(default)]
    applicable_failure_types: BTreeSet<FailureType>,
    #[serde(default = "default_intervention_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_timeout_action")]
    timeout_action: RepairActionCode,
}

fn default_intervention_timeout_ms() -> u64 { 24 * 60 * 60 * 1000 }
fn default_timeout_action() -> RepairActionCode { RepairActionCode::EndExecution }

/// Pauses a broken node for a human decision.
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::ManualIntervention
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        if !event.to_status.is_broken() || event.is_previous_adviser_expired {
            return Ok(false);
        }
        let params: ManualInterventionParameters = event.parameters()?;
        Ok(failure_types_match(&params.applicable_failure_types, event))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        let params: ManualInterventionParameters = event.parameters()?;
        Ok(Some(Advise::InterventionWait {
            timeout_ms: params.timeout_ms,
            timeout_action: params.timeout_action,
        }))
    }
}

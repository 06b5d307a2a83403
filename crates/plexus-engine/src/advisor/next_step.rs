use serde::Deserialize;

use plexus_core::advise::Advise;
use plexus_core::error::Result;
use plexus_core::plan::AdviserType;
use plexus_core::types::Status;

use super::{Adviser, AdvisingEvent};

#[derive(Debug, Clone, Default, Deserialize)]
struct NextNodeParameters {
    #[serde(default)]
    next_node_id: Option<String>,
}

fn next_step(event: &AdvisingEvent) -> Result<Option<Advise>> {
    let params: NextNodeParameters = event.parameters()?;
    Ok(Some(Advise::NextStep {
        next_node_id: params.next_node_id,
        to_status: None,
    }))
}

/// Continues to the next sibling when the node did not break.
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::OnSuccess
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(matches!(
            event.to_status,
            Status::Succeeded | Status::IgnoreFailed | Status::Skipped
        ))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        next_step(event)
    }
}

/// Continues to a failure path when the node broke. The node keeps its
/// broken status.
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::OnFail
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_broken())
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        next_step(event)
    }
}

/// Unconditional sequencing, except out of an aborted node.
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::NextStep
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        Ok(event.to_status.is_final() && event.to_status != Status::Aborted)
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        next_step(event)
    }
}

use std::collections::BTreeSet;

use serde::Deserialize;

use plexus_core::advise::{Advise, RepairActionCode};
use plexus_core::error::{PlexusError, Result};
use plexus_core::plan::AdviserType;
use plexus_core::types::{FailureType, Status};

use super::{failure_types_match, Adviser, AdvisingEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct RetryAdviserParameters {
    /// Wait before each retry; the last value repeats once exhausted.
    #[serde(default)]
    pub wait_interval_list: Vec<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_repair_action")]
    pub repair_action_code_after_retry: RepairActionCode,
    #[serde(default)]
    pub applicable_failure_types: BTreeSet<FailureType>,
    /// Where to continue when retries run out and the action is `IGNORE`.
    #[serde(default)]
    pub next_node_id: Option<String>,
}

fn default_repair_action() -> RepairActionCode { RepairActionCode::EndExecution }

/// Wait before retry number `retry_count` (0-based). Clamped to the last
/// configured interval; zero when none are configured.
pub fn wait_interval(intervals: &[u64], retry_count: usize) -> u64 {
    match intervals.len() {
        0 => 0,
        len => intervals[retry_count.min(len - 1)],
    }
}

/// Re-runs a node in a retryable status until its retry budget is spent,
/// then applies the configured repair action.
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> AdviserType {
        AdviserType::Retry
    }

    fn can_advise(&self, event: &AdvisingEvent) -> Result<bool> {
        if !event.to_status.is_retryable() || event.is_previous_adviser_expired {
            return Ok(false);
        }
        let params: RetryAdviserParameters = event.parameters()?;
        Ok(failure_types_match(&params.applicable_failure_types, event))
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        if !Status::retryable().contains(&event.to_status) {
            return Ok(None);
        }
        let params: RetryAdviserParameters = event.parameters()?;

        let retry_count = event.retry_count();
        if retry_count < params.retry_count as usize {
            return Ok(Some(Advise::Retry {
                node_execution_id: event.node_execution_id.clone(),
                wait_interval_ms: wait_interval(&params.wait_interval_list, retry_count),
            }));
        }

        match params.repair_action_code_after_retry {
            code if code.is_escalation() => Ok(None),
            RepairActionCode::Ignore => Ok(Some(Advise::NextStep {
                next_node_id: params.next_node_id,
                to_status: Some(Status::IgnoreFailed),
            })),
            other => Err(PlexusError::InvalidRequest(format!(
                "repair action {other:?} is not valid after retries"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::event;
    use super::*;
    use plexus_core::types::FailureInfo;
    use serde_json::json;

    fn timeout() -> Option<FailureInfo> {
        Some(FailureInfo::new("deadline exceeded", FailureType::TimeoutError))
    }

    #[test]
    fn wait_interval_clamps_to_last_value() {
        let list = [5, 10, 20];
        assert_eq!(wait_interval(&list, 0), 5);
        assert_eq!(wait_interval(&list, 1), 10);
        assert_eq!(wait_interval(&list, 2), 20);
        assert_eq!(wait_interval(&list, 3), 20);
        for n in 0..5 {
            assert_eq!(wait_interval(&[], n), 0);
        }
    }

    #[test]
    fn advises_retry_while_budget_remains() {
        let mut e = event(
            Status::Failed,
            timeout(),
            json!({"wait_interval_list": [5, 10, 20], "retry_count": 3}),
        );
        e.retry_ids = vec!["older".into()];

        assert!(RetryAdviser.can_advise(&e).unwrap());
        assert_eq!(
            RetryAdviser.on_advise_event(&e).unwrap(),
            Some(Advise::Retry {
                node_execution_id: "step-rt".into(),
                wait_interval_ms: 10
            })
        );
    }

    #[test]
    fn exhausted_with_ignore_moves_to_next_node() {
        let mut e = event(
            Status::Failed,
            timeout(),
            json!({
                "retry_count": 1,
                "repair_action_code_after_retry": "IGNORE",
                "next_node_id": "X"
            }),
        );
        e.retry_ids = vec!["first".into()];
        let advise = RetryAdviser.on_advise_event(&e).unwrap();
        assert!(matches!(
            advise,
            Some(Advise::NextStep { next_node_id: Some(ref id), .. }) if id == "X"
        ));
    }

    #[test]
    fn exhausted_with_escalation_gives_no_advice() {
        for code in [
            "MANUAL_INTERVENTION",
            "ROLLBACK_WORKFLOW",
            "ROLLBACK_PHASE",
            "END_EXECUTION",
            "ABORT_WORKFLOW_EXECUTION",
        ] {
            let e = event(
                Status::Failed,
                timeout(),
                json!({"retry_count": 0, "repair_action_code_after_retry": code}),
            );
            assert_eq!(RetryAdviser.on_advise_event(&e).unwrap(), None, "{code}");
        }
    }

    #[test]
    fn exhausted_with_other_action_is_a_configuration_error() {
        let e = event(
            Status::Failed,
            timeout(),
            json!({"retry_count": 0, "repair_action_code_after_retry": "MARK_AS_SUCCESS"}),
        );
        assert!(matches!(
            RetryAdviser.on_advise_event(&e),
            Err(PlexusError::InvalidRequest(_))
        ));
    }

    #[test]
    fn non_retryable_status_defers() {
        let e = event(Status::Succeeded, None, json!({"retry_count": 3}));
        assert!(!RetryAdviser.can_advise(&e).unwrap());
        assert_eq!(RetryAdviser.on_advise_event(&e).unwrap(), None);
    }

    #[test]
    fn applicable_failure_types_filter() {
        let params = json!({"retry_count": 3, "applicable_failure_types": ["TIMEOUT_ERROR"]});
        let app_error = Some(FailureInfo::new("exit 1", FailureType::ApplicationError));
        assert!(!RetryAdviser
            .can_advise(&event(Status::Failed, app_error, params.clone()))
            .unwrap());
        assert!(RetryAdviser
            .can_advise(&event(Status::Failed, timeout(), params.clone()))
            .unwrap());

        // Nothing reported counts as UNKNOWN_FAILURE.
        assert!(!RetryAdviser
            .can_advise(&event(Status::Errored, None, params))
            .unwrap());
    }

    #[test]
    fn expired_previous_adviser_blocks_retry() {
        let mut e = event(Status::Expired, None, json!({"retry_count": 3}));
        e.is_previous_adviser_expired = true;
        assert!(!RetryAdviser.can_advise(&e).unwrap());
    }

    #[test]
    fn malformed_parameters_are_reported() {
        let e = event(Status::Failed, None, json!({"retry_count": "three"}));
        assert!(matches!(
            RetryAdviser.can_advise(&e),
            Err(PlexusError::InvalidRequest(_))
        ));
    }
}

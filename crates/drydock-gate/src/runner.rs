//! Drives one version through the validation step of its lifecycle.

use chrono::Utc;
use tracing::{info, instrument};

use drydock_core::obs::emit_validation_evaluated;
use drydock_core::{DrydockError, DrydockResult, PromotionOrchestrator, TransitionOutcome};
use drydock_state::{AuditEvent, LifecycleState, Requester, VersionKey};

use crate::gate::{ValidationGate, ValidationReport};

/// What happened when a version was driven through validation.
#[derive(Debug)]
pub struct ValidationRun {
    /// Outcome of the last transition request issued.
    pub outcome: TransitionOutcome,

    /// The gate's report. Absent when the version never reached the gate
    /// because policy held it at the door.
    pub report: Option<ValidationReport>,
}

impl ValidationRun {
    /// True when the version came out the far side as `validated`.
    pub fn validated(&self) -> bool {
        matches!(
            self.outcome,
            TransitionOutcome::Committed {
                to: LifecycleState::Validated,
            }
        )
    }
}

/// Drive `key` through validation: enter `validating` on behalf of
/// `requester`, run the gate, then commit `validated` or `rejected` from
/// the report. The verdict edges are always requested by the gate itself.
///
/// Calling this for a version already sitting in `validating` skips the
/// entry edge and goes straight to the checks, which is how the daemon
/// resumes an interrupted validation after a restart.
#[instrument(skip_all, fields(key = %key))]
pub async fn run_validation(
    orch: &PromotionOrchestrator,
    gate: &ValidationGate,
    key: &VersionKey,
    requester: Requester,
) -> DrydockResult<ValidationRun> {
    let record = orch.versions().get(key).await?;

    match record.state {
        LifecycleState::Uploaded => {
            let outcome = orch
                .request_transition(key, LifecycleState::Validating, requester, Utc::now())
                .await?;
            if !matches!(outcome, TransitionOutcome::Committed { .. }) {
                return Ok(ValidationRun {
                    outcome,
                    report: None,
                });
            }
        }
        LifecycleState::Validating => {
            info!("resuming validation already in flight");
        }
        LifecycleState::Rejected => {
            return Err(DrydockError::ValidationFailed { key: key.clone() });
        }
        other => {
            return Err(DrydockError::InvalidTransition {
                from: other,
                to: LifecycleState::Validating,
            });
        }
    }

    let record = orch.versions().get(key).await?;
    let report = gate.validate(&record).await;
    emit_validation_evaluated(key, report.passed, report.failed_count());

    let outcome = if report.passed {
        orch.request_transition(
            key,
            LifecycleState::Validated,
            Requester::ValidationGate,
            Utc::now(),
        )
        .await?
    } else {
        orch.audit()
            .append(
                AuditEvent::ValidationRejected {
                    key: key.clone(),
                    failed_checks: report.failed_names(),
                },
                Utc::now(),
            )
            .await?;
        orch.request_transition(
            key,
            LifecycleState::Rejected,
            Requester::ValidationGate,
            Utc::now(),
        )
        .await?
    };

    Ok(ValidationRun {
        outcome,
        report: Some(report),
    })
}

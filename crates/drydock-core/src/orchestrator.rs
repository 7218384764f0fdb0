//! The promotion orchestrator: single writer of lifecycle state.
//!
//! Every transition request flows through here. The orchestrator checks the
//! lifecycle graph, consults the policy rule set, suspends gated transitions
//! into the approval queue, commits state through the version store's
//! compare-and-set, and issues the fleet commands a committed transition
//! implies. Transitions toward a failure state (`rejected`, `rolled_back`)
//! bypass policy entirely: stopping a bad rollout must never wait on a
//! reviewer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use drydock_state::{
    ApprovalId, ApprovalKind, ApprovalStatus, ApprovalStore, AuditEvent, AuditLog, DeployCommand,
    HumanDecision, LifecycleState, Requester, Transition, VersionKey, VersionStore,
};

use crate::approvals::ApprovalQueue;
use crate::collab::{DeployError, DeploymentController};
use crate::config::DrydockConfig;
use crate::error::{DrydockError, DrydockResult};
use crate::metrics::METRICS;
use crate::policy::{Decision, PolicyHandle, PolicySet};

/// What happened to a transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Committed {
        to: LifecycleState,
    },
    /// Refused by policy. The version stays where it was.
    Denied {
        reason: String,
    },
    /// Suspended into the approval queue. The version stays where it was
    /// until a reviewer rules on the request.
    ApprovalPending {
        request_id: ApprovalId,
    },
    /// The state committed, but a fleet command exhausted its retries.
    /// An operator must approve the re-issue.
    Stalled {
        to: LifecycleState,
        request_id: ApprovalId,
    },
}

pub struct PromotionOrchestrator {
    versions: Arc<dyn VersionStore>,
    approvals: ApprovalQueue,
    audit: Arc<dyn AuditLog>,
    deploy: Arc<dyn DeploymentController>,
    policy: Arc<PolicyHandle>,
    config: DrydockConfig,
}

impl PromotionOrchestrator {
    pub fn new(
        versions: Arc<dyn VersionStore>,
        approvals: Arc<dyn ApprovalStore>,
        audit: Arc<dyn AuditLog>,
        deploy: Arc<dyn DeploymentController>,
        policy: Arc<PolicyHandle>,
        config: DrydockConfig,
    ) -> Self {
        PromotionOrchestrator {
            versions,
            approvals: ApprovalQueue::new(approvals),
            audit,
            deploy,
            policy,
            config,
        }
    }

    pub fn versions(&self) -> &Arc<dyn VersionStore> {
        &self.versions
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn config(&self) -> &DrydockConfig {
        &self.config
    }

    /// Request one lifecycle transition. Requesting the state the version is
    /// already in is a no-op `Committed`.
    #[instrument(skip_all, fields(key = %key, to = %to, requester = %requester))]
    pub async fn request_transition(
        &self,
        key: &VersionKey,
        to: LifecycleState,
        requester: Requester,
        now: DateTime<Utc>,
    ) -> DrydockResult<TransitionOutcome> {
        self.transition_inner(key, to, requester, None, None, now)
            .await
    }

    /// Roll a canary or promoting version back, recording why. Bypasses
    /// policy like every fail-direction transition.
    #[instrument(skip_all, fields(key = %key, requester = %requester))]
    pub async fn trigger_rollback(
        &self,
        key: &VersionKey,
        requester: Requester,
        reason: String,
        now: DateTime<Utc>,
    ) -> DrydockResult<TransitionOutcome> {
        self.transition_inner(
            key,
            LifecycleState::RolledBack,
            requester,
            None,
            Some(reason),
            now,
        )
        .await
    }

    /// Abandon an in-flight version: `validating` is rejected, `canary` and
    /// `promoting` are rolled back. Other states have nothing to cancel.
    pub async fn cancel(
        &self,
        key: &VersionKey,
        requester: Requester,
        now: DateTime<Utc>,
    ) -> DrydockResult<TransitionOutcome> {
        let record = self.versions.get(key).await?;
        let reason = format!("cancelled by {}", requester.id());
        match record.state {
            LifecycleState::Validating => {
                self.transition_inner(key, LifecycleState::Rejected, requester, None, None, now)
                    .await
            }
            LifecycleState::Canary | LifecycleState::Promoting => {
                self.transition_inner(
                    key,
                    LifecycleState::RolledBack,
                    requester,
                    None,
                    Some(reason),
                    now,
                )
                .await
            }
            other => Err(DrydockError::InvalidTransition {
                from: other,
                to: LifecycleState::RolledBack,
            }),
        }
    }

    /// Apply a human decision to an open approval request.
    ///
    /// An expired request is marked expired and the decision is refused. An
    /// approved policy gate re-runs the suspended transition against the
    /// current policy; a rule set that now denies it still denies it. An
    /// approved stalled deployment re-issues the recorded command.
    #[instrument(skip_all, fields(request_id = %request_id, approved, resolved_by))]
    pub async fn resolve_approval(
        &self,
        request_id: &ApprovalId,
        approved: bool,
        resolved_by: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> DrydockResult<TransitionOutcome> {
        let approval = self.approvals.get(request_id).await?;
        if approval.status.is_terminal() {
            return Err(DrydockError::ApprovalAlreadyResolved {
                request_id: request_id.to_string(),
            });
        }
        if approval.is_expired_at(now) {
            self.approvals
                .resolve(request_id, ApprovalStatus::Expired, resolved_by, now)
                .await?;
            self.audit
                .append(
                    AuditEvent::ApprovalExpired {
                        request_id: request_id.clone(),
                        key: approval.transition.key.clone(),
                    },
                    now,
                )
                .await?;
            METRICS.inc_approvals_resolved();
            return Err(DrydockError::ApprovalExpired {
                request_id: request_id.to_string(),
            });
        }

        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied {
                reason: note.clone().unwrap_or_else(|| "denied".to_string()),
            }
        };
        let approval = self
            .approvals
            .resolve(request_id, status, resolved_by, now)
            .await?;
        METRICS.inc_approvals_resolved();
        self.audit
            .append(
                AuditEvent::ApprovalResolved {
                    request_id: request_id.clone(),
                    key: approval.transition.key.clone(),
                    approved,
                    resolved_by: resolved_by.to_string(),
                    note: note.clone(),
                },
                now,
            )
            .await?;

        if !approved {
            info!(key = %approval.transition.key, "approval denied");
            return Ok(TransitionOutcome::Denied {
                reason: format!("denied by {resolved_by}"),
            });
        }

        match &approval.kind {
            ApprovalKind::PolicyGate => {
                // The version may have moved on while the request sat open,
                // e.g. a rollback won the race. The approval is consumed
                // either way.
                let record = self.versions.get(&approval.transition.key).await?;
                if record.state != approval.transition.from {
                    return Err(DrydockError::StaleTransition {
                        key: approval.transition.key.clone(),
                        expected: approval.transition.from,
                        actual: record.state,
                    });
                }
                let decision = HumanDecision {
                    decided_by: resolved_by.to_string(),
                    approved: true,
                    decided_at: now,
                    note,
                };
                self.transition_inner(
                    &approval.transition.key,
                    approval.transition.to,
                    approval.transition.requester.clone(),
                    Some(decision),
                    None,
                    now,
                )
                .await
            }
            ApprovalKind::DeploymentStalled { command } => {
                match self.issue_with_retry(command).await {
                    Ok(()) => {
                        info!(command = %command, "stalled fleet command re-issued");
                        Ok(TransitionOutcome::Committed {
                            to: approval.transition.to,
                        })
                    }
                    Err(err) => {
                        let request_id = self
                            .open_stall(&approval.transition, command, &err, now)
                            .await?;
                        Ok(TransitionOutcome::Stalled {
                            to: approval.transition.to,
                            request_id,
                        })
                    }
                }
            }
        }
    }

    /// Expire overdue approval requests. Returns how many were expired.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> DrydockResult<usize> {
        let expired = self.approvals.sweep_expired(now).await?;
        for record in &expired {
            self.audit
                .append(
                    AuditEvent::ApprovalExpired {
                        request_id: record.request_id.clone(),
                        key: record.transition.key.clone(),
                    },
                    now,
                )
                .await?;
            METRICS.inc_approvals_resolved();
        }
        Ok(expired.len())
    }

    /// Validate and install a new policy rule set, leaving an audit trace.
    pub async fn reload_policy(
        &self,
        set: PolicySet,
        reloaded_by: &str,
        now: DateTime<Utc>,
    ) -> DrydockResult<usize> {
        let rule_count = self.policy.reload(set).await?;
        self.audit
            .append(
                AuditEvent::PolicyReloaded {
                    rule_count,
                    reloaded_by: reloaded_by.to_string(),
                },
                now,
            )
            .await?;
        Ok(rule_count)
    }

    async fn transition_inner(
        &self,
        key: &VersionKey,
        to: LifecycleState,
        requester: Requester,
        decision: Option<HumanDecision>,
        rollback_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DrydockResult<TransitionOutcome> {
        let record = self.versions.get(key).await?;
        let from = record.state;

        if from == to {
            return Ok(TransitionOutcome::Committed { to });
        }
        if !from.can_transition_to(to) {
            return Err(DrydockError::InvalidTransition { from, to });
        }

        let mut transition = Transition::new(key.clone(), from, to, requester.clone(), now);
        if let Some(d) = decision {
            transition = transition.with_decision(d);
        }

        let fail_direction = matches!(
            to,
            LifecycleState::Rejected | LifecycleState::RolledBack
        );
        if !fail_direction {
            let policy = self.policy.snapshot().await;
            match policy.evaluate(&transition, &record.metadata) {
                Decision::Allow => {}
                Decision::Deny { reason } => {
                    self.audit
                        .append(
                            AuditEvent::TransitionDenied {
                                key: key.clone(),
                                from,
                                to,
                                requester: requester.clone(),
                                reason: reason.clone(),
                            },
                            now,
                        )
                        .await?;
                    METRICS.inc_transitions_denied();
                    warn!(reason = %reason, "transition denied by policy");
                    return Ok(TransitionOutcome::Denied { reason });
                }
                Decision::RequireApproval { reason } => {
                    let satisfied = transition.decision.as_ref().is_some_and(|d| d.approved);
                    if !satisfied {
                        let (approval, created) = self
                            .approvals
                            .open(
                                transition.clone(),
                                ApprovalKind::PolicyGate,
                                reason.clone(),
                                self.config.approval_expiry_secs,
                                now,
                            )
                            .await?;
                        if created {
                            self.audit
                                .append(
                                    AuditEvent::ApprovalRequested {
                                        request_id: approval.request_id.clone(),
                                        key: key.clone(),
                                        from,
                                        to,
                                        reason,
                                    },
                                    now,
                                )
                                .await?;
                            METRICS.inc_approvals_created();
                        }
                        return Ok(TransitionOutcome::ApprovalPending {
                            request_id: approval.request_id,
                        });
                    }
                }
            }
        }

        self.commit(transition, rollback_reason, now).await
    }

    async fn commit(
        &self,
        transition: Transition,
        rollback_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DrydockResult<TransitionOutcome> {
        let key = transition.key.clone();
        let to = transition.to;

        let retired = if to == LifecycleState::Active {
            let swap = self.versions.activate(&key, now).await?;
            self.audit
                .append(
                    AuditEvent::TransitionCommitted {
                        key: key.clone(),
                        from: transition.from,
                        to,
                        requester: transition.requester.clone(),
                    },
                    now,
                )
                .await?;
            METRICS.inc_transitions_committed();
            if let Some(prior) = &swap.retired {
                self.audit
                    .append(
                        AuditEvent::TransitionCommitted {
                            key: prior.clone(),
                            from: LifecycleState::Active,
                            to: LifecycleState::Retired,
                            requester: transition.requester.clone(),
                        },
                        now,
                    )
                    .await?;
                METRICS.inc_transitions_committed();
            }
            swap.retired
        } else {
            self.versions
                .compare_and_set_state(&key, transition.from, to, now)
                .await?;
            self.audit
                .append(
                    AuditEvent::TransitionCommitted {
                        key: key.clone(),
                        from: transition.from,
                        to,
                        requester: transition.requester.clone(),
                    },
                    now,
                )
                .await?;
            METRICS.inc_transitions_committed();
            None
        };
        info!(from = %transition.from, to = %to, "transition committed");

        if to == LifecycleState::RolledBack {
            let reason = rollback_reason
                .unwrap_or_else(|| format!("requested by {}", transition.requester.id()));
            self.audit
                .append(
                    AuditEvent::RollbackTriggered {
                        key: key.clone(),
                        from: transition.from,
                        requester: transition.requester.clone(),
                        reason,
                    },
                    now,
                )
                .await?;
            METRICS.inc_rollbacks();
        }

        let plan = self.fleet_plan(&key, to, retired.as_ref());
        if plan.is_empty() {
            return Ok(TransitionOutcome::Committed { to });
        }
        match self.run_fleet_plan(&transition, plan, now).await? {
            Some(request_id) => Ok(TransitionOutcome::Stalled { to, request_id }),
            None => Ok(TransitionOutcome::Committed { to }),
        }
    }

    /// Fleet commands implied by entering `to`. Activation shifts the full
    /// traffic share to the new version and unloads the one it displaced.
    fn fleet_plan(
        &self,
        key: &VersionKey,
        to: LifecycleState,
        retired: Option<&VersionKey>,
    ) -> Vec<DeployCommand> {
        match to {
            LifecycleState::Canary => vec![
                DeployCommand::Deploy { key: key.clone() },
                DeployCommand::ShiftTraffic {
                    key: key.clone(),
                    percent: self.config.canary.traffic_percent,
                },
            ],
            LifecycleState::Active => {
                let mut plan = vec![DeployCommand::ShiftTraffic {
                    key: key.clone(),
                    percent: 100,
                }];
                if let Some(prior) = retired {
                    plan.push(DeployCommand::Retire { key: prior.clone() });
                }
                plan
            }
            LifecycleState::RolledBack => vec![DeployCommand::ShiftTraffic {
                key: key.clone(),
                percent: 0,
            }],
            LifecycleState::Retired => vec![
                DeployCommand::ShiftTraffic {
                    key: key.clone(),
                    percent: 0,
                },
                DeployCommand::Retire { key: key.clone() },
            ],
            _ => Vec::new(),
        }
    }

    /// Run every command in order. A command that exhausts its retries
    /// opens its own stalled-deployment request; later commands still run,
    /// so each approved re-issue is self-contained. Returns the first
    /// stalled request, if any.
    async fn run_fleet_plan(
        &self,
        transition: &Transition,
        plan: Vec<DeployCommand>,
        now: DateTime<Utc>,
    ) -> DrydockResult<Option<ApprovalId>> {
        let mut first_stall = None;
        for command in plan {
            if let Err(err) = self.issue_with_retry(&command).await {
                let request_id = self.open_stall(transition, &command, &err, now).await?;
                if first_stall.is_none() {
                    first_stall = Some(request_id);
                }
            }
        }
        Ok(first_stall)
    }

    /// A command failure is handled by escalation, not by erroring out. Only
    /// when the escalation itself cannot be recorded does the failure surface
    /// as `DeploymentCommandFailed`.
    async fn open_stall(
        &self,
        transition: &Transition,
        command: &DeployCommand,
        err: &DeployError,
        now: DateTime<Utc>,
    ) -> DrydockResult<ApprovalId> {
        let reason = format!(
            "fleet command '{command}' failed after {} attempts: {err}",
            self.config.deploy_retry.max_attempts.max(1)
        );
        let (approval, created) = self
            .approvals
            .open(
                transition.clone(),
                ApprovalKind::DeploymentStalled {
                    command: command.clone(),
                },
                reason,
                self.config.approval_expiry_secs,
                now,
            )
            .await
            .map_err(|open_err| DrydockError::DeploymentCommandFailed {
                command: command.to_string(),
                detail: format!("{err}; could not open operator request: {open_err}"),
            })?;
        if created {
            self.audit
                .append(
                    AuditEvent::DeploymentStalled {
                        key: transition.key.clone(),
                        command: command.clone(),
                        request_id: approval.request_id.clone(),
                    },
                    now,
                )
                .await?;
            METRICS.inc_approvals_created();
        }
        warn!(
            request_id = %approval.request_id,
            command = %command,
            "deployment stalled, operator review required"
        );
        Ok(approval.request_id)
    }

    async fn issue_with_retry(&self, command: &DeployCommand) -> Result<(), DeployError> {
        let attempts = self.config.deploy_retry.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.deploy_retry.base_delay_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.issue(command).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(command = %command, attempt, "fleet command succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) => {
                    if attempt >= attempts {
                        return Err(err);
                    }
                    METRICS.inc_deploy_retries();
                    warn!(
                        command = %command,
                        attempt,
                        error = %err,
                        "fleet command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    async fn issue(&self, command: &DeployCommand) -> Result<(), DeployError> {
        match command {
            DeployCommand::Deploy { key } => {
                let record = self
                    .versions
                    .get(key)
                    .await
                    .map_err(|e| DeployError(format!("fetch {key}: {e}")))?;
                self.deploy.deploy(&record).await
            }
            DeployCommand::ShiftTraffic { key, percent } => {
                self.deploy.shift_traffic(key, *percent).await
            }
            DeployCommand::Retire { key } => self.deploy.retire(key).await,
        }
    }
}

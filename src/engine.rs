//! Service layer API for the approval workflow.
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::applier::{ApplyOutcome, ChangeApplier, DefaultChangeApplier};
use crate::audit::{AuditAction, AuditRecord, AuditSink, TracingAuditSink};
use crate::context::{ApprovalContext, Escalation, RequestDraft, Transition};
use crate::error::{GovernanceError, Result};
use crate::governance::GovernanceValidator;
use crate::notify::{Notification, Notifier, TracingNotifier};
use crate::store::GovernanceStore;
use crate::types::{Actor, ApprovalAction, RequestStatus, TimeStamp};
use crate::workflow::{DEFAULT_SCOPE, WorkflowStore};

/// A stage whose timeout has passed without a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueStage {
    pub request_id: String,
    pub stage_order: u32,
    pub deadline: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub escalated: Vec<(String, Escalation)>,
    pub skipped: usize,
}

pub struct ApprovalEngine<R> {
    repo: Arc<R>,
    workflows: WorkflowStore<R>,
    validator: GovernanceValidator,
    applier: Arc<dyn ChangeApplier>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
}

impl<R: GovernanceStore> ApprovalEngine<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            workflows: WorkflowStore::new(Arc::clone(&repo)),
            applier: Arc::new(DefaultChangeApplier::new(Arc::clone(&repo))),
            repo,
            validator: GovernanceValidator::default(),
            notifier: Arc::new(TracingNotifier),
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_validator(mut self, validator: GovernanceValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_applier(mut self, applier: Arc<dyn ChangeApplier>) -> Self {
        self.applier = applier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn workflows(&self) -> &WorkflowStore<R> {
        &self.workflows
    }

    pub fn validator(&self) -> &GovernanceValidator {
        &self.validator
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    /// Open a new approval request for `draft`, bound to whichever workflow
    /// governs it. Without a workflow the request is approved and applied
    /// immediately once it clears the SoD gate.
    pub fn create(&self, mut draft: RequestDraft, requester: &Actor) -> Result<ApprovalContext> {
        if draft.entity_id.trim().is_empty() {
            return Err(GovernanceError::validation("entityId", "entity id must not be empty"));
        }
        if draft.scope.trim().is_empty() {
            draft.scope = DEFAULT_SCOPE.to_owned();
        }

        if let Some(permissions) = draft.payload.permissions()? {
            let report = self.validator.validate(&permissions);
            if !report.can_proceed {
                warn!(
                    entity_id = %draft.entity_id,
                    requested_by = %requester.id,
                    critical = report.sod_result.critical_count,
                    "Request refused by segregation-of-duties gate"
                );
                return Err(GovernanceError::validation(
                    "payload.permissions",
                    report.blocked_reason.unwrap_or_default(),
                ));
            }

            let computed = report.risk_score;
            draft.risk_score = match draft.risk_score.take() {
                Some(declared) if declared.value >= computed.value => Some(declared),
                _ => Some(computed),
            };
        }

        let risk_value = draft.risk_score.as_ref().map(|r| r.value);
        let workflow = self.workflows.resolve_for_risk(
            draft.entity_type,
            draft.action,
            &draft.scope,
            risk_value,
        )?;

        let now = TimeStamp::new();
        let context = ApprovalContext::open(&draft, requester, workflow.as_ref(), &now);
        self.repo.insert_request(&context)?;

        info!(
            request_id = %context.id(),
            entity_type = draft.entity_type.as_str(),
            entity_id = %draft.entity_id,
            workflow_id = ?context.request.workflow_id,
            risk = ?risk_value,
            "Approval request created"
        );
        self.audit(
            AuditRecord::new(AuditAction::RequestCreated, context.id(), &requester.id)
                .status(context.request.status),
        );

        if workflow.is_some() {
            self.announce_stage(&context, 1);
        } else {
            debug!(request_id = %context.id(), "No governing workflow, applying directly");
            self.apply_approved(&context);
        }

        Ok(context)
    }

    pub fn get(&self, request_id: &str) -> Result<ApprovalContext> {
        self.repo
            .get_request(request_id)?
            .ok_or_else(|| GovernanceError::not_found("approval request", request_id))
    }

    /// Record an APPROVE or REJECT from `actor` on the request's current stage.
    pub fn process_approval_action(
        &self,
        request_id: &str,
        actor: &Actor,
        action: ApprovalAction,
        comment: Option<&str>,
    ) -> Result<ApprovalContext> {
        let now = TimeStamp::new();
        let (context, transition) = self
            .repo
            .advance_stage_atomically(request_id, |ctx| ctx.record_verdict(actor, action, comment, &now))
            .inspect_err(|err| refused(err, request_id, actor, "approval action"))?;

        let stage = context.request.current_stage;
        match transition {
            Transition::QuorumPending { stage, approved, required } => {
                info!(request_id, stage, approved, required, "Approval counted, quorum pending");
                self.audit(
                    AuditRecord::new(AuditAction::StageApproved, request_id, &actor.id)
                        .stage(stage)
                        .detail(format!("{approved}/{required}")),
                );
            }
            Transition::Advanced { from, to } => {
                info!(request_id, from, to, "Stage complete, advanced");
                self.audit(
                    AuditRecord::new(AuditAction::StageAdvanced, request_id, &actor.id)
                        .stage(to)
                        .status(context.request.status),
                );
                self.announce_stage(&context, to);
            }
            Transition::Approved => {
                info!(request_id, stage, approver = %actor.id, "Request approved");
                self.audit(
                    AuditRecord::new(AuditAction::RequestApproved, request_id, &actor.id)
                        .stage(stage)
                        .status(RequestStatus::Approved),
                );
                self.announce_resolution(&context);
                self.apply_approved(&context);
            }
            Transition::Rejected => {
                info!(request_id, stage, rejected_by = %actor.id, "Request rejected");
                self.audit(
                    AuditRecord::new(AuditAction::RequestRejected, request_id, &actor.id)
                        .stage(stage)
                        .status(RequestStatus::Rejected),
                );
                self.announce_resolution(&context);
            }
        }

        Ok(context)
    }

    pub fn approve(&self, request_id: &str, actor: &Actor, comment: Option<&str>) -> Result<ApprovalContext> {
        self.process_approval_action(request_id, actor, ApprovalAction::Approve, comment)
    }

    pub fn reject(&self, request_id: &str, actor: &Actor, comment: &str) -> Result<ApprovalContext> {
        self.process_approval_action(request_id, actor, ApprovalAction::Reject, Some(comment))
    }

    pub fn delegate(
        &self,
        request_id: &str,
        actor: &Actor,
        target_user_id: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalContext> {
        let now = TimeStamp::new();
        let (context, stage_order) = self
            .repo
            .advance_stage_atomically(request_id, |ctx| ctx.delegate(actor, target_user_id, comment, &now))
            .inspect_err(|err| refused(err, request_id, actor, "delegation"))?;

        info!(request_id, stage = stage_order, from = %actor.id, to = %target_user_id, "Stage delegated");
        self.audit(
            AuditRecord::new(AuditAction::RequestDelegated, request_id, &actor.id)
                .stage(stage_order)
                .detail(format!("delegated to {target_user_id}")),
        );
        self.dispatch(Notification::Delegated {
            request_id: request_id.to_owned(),
            stage_order,
            from_user_id: actor.id.clone(),
            target_user_id: target_user_id.trim().to_owned(),
        });

        Ok(context)
    }

    pub fn escalate(&self, request_id: &str, actor: &Actor, comment: Option<&str>) -> Result<ApprovalContext> {
        let now = TimeStamp::new();
        let (context, escalation) = self
            .repo
            .advance_stage_atomically(request_id, |ctx| ctx.escalate(actor, comment, &now))
            .inspect_err(|err| refused(err, request_id, actor, "escalation"))?;

        info!(request_id, from = escalation.from, to = escalation.to, by = %actor.id, "Request escalated");
        self.audit(
            AuditRecord::new(AuditAction::RequestEscalated, request_id, &actor.id)
                .stage(escalation.to)
                .detail(format!("stage {} -> {}", escalation.from, escalation.to)),
        );
        self.announce_stage(&context, escalation.to);

        Ok(context)
    }

    pub fn cancel(&self, request_id: &str, requester: &Actor, reason: &str) -> Result<ApprovalContext> {
        let now = TimeStamp::new();
        let (context, ()) = self
            .repo
            .advance_stage_atomically(request_id, |ctx| ctx.cancel(requester, reason, &now))
            .inspect_err(|err| refused(err, request_id, requester, "cancellation"))?;

        info!(request_id, "Request cancelled by requester");
        self.audit(
            AuditRecord::new(AuditAction::RequestCancelled, request_id, &requester.id)
                .status(RequestStatus::Cancelled)
                .detail(reason.trim()),
        );

        Ok(context)
    }

    /// Open requests whose current stage the user may act on, oldest first.
    /// The user's own requests are never listed.
    pub fn pending_for_user(&self, user_id: &str, role_ids: &[String]) -> Result<Vec<ApprovalContext>> {
        let mut pending: Vec<ApprovalContext> = self
            .repo
            .list_open_requests()?
            .into_iter()
            .filter(|ctx| ctx.awaits(user_id, role_ids))
            .collect();
        pending.sort_by(|a, b| a.request.created_at.cmp(&b.request.created_at));
        Ok(pending)
    }

    /// In-progress stages whose timeout elapsed before `now`.
    pub fn overdue_stages(&self, now: &TimeStamp<Utc>) -> Result<Vec<OverdueStage>> {
        Ok(self
            .repo
            .list_open_requests()?
            .into_iter()
            .filter_map(|ctx| {
                let deadline = ctx.stage_deadline()?;
                (deadline < *now).then(|| OverdueStage {
                    request_id: ctx.request.id.clone(),
                    stage_order: ctx.request.current_stage,
                    deadline,
                })
            })
            .collect())
    }

    /// Escalate every overdue stage on behalf of the timeout scheduler.
    /// Stages with nowhere to escalate to are left alone.
    pub fn sweep_overdue(&self, now: &TimeStamp<Utc>) -> Result<SweepReport> {
        let scheduler = Actor::system("stage-timeout");
        let mut report = SweepReport::default();

        for overdue in self.overdue_stages(now)? {
            match self.escalate(&overdue.request_id, &scheduler, Some("Stage timed out")) {
                Ok(context) => {
                    let escalation = Escalation {
                        from: overdue.stage_order,
                        to: context.request.current_stage,
                    };
                    report.escalated.push((overdue.request_id, escalation));
                }
                Err(GovernanceError::StateConflict(reason)) => {
                    debug!(request_id = %overdue.request_id, %reason, "Overdue stage left in place");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        if !report.escalated.is_empty() {
            info!(escalated = report.escalated.len(), skipped = report.skipped, "Overdue sweep finished");
        }
        Ok(report)
    }

    /// Re-run the change applier for an APPROVED request.
    pub fn retry_application(&self, request_id: &str) -> Result<ApplyOutcome> {
        let context = self.get(request_id)?;
        if context.request.status != RequestStatus::Approved {
            return Err(GovernanceError::StateConflict(format!(
                "request {request_id} is {:?}; only approved requests are applied",
                context.request.status
            )));
        }

        self.applier
            .apply(&context.request)
            .map_err(|err| GovernanceError::ApplierFailure {
                request_id: request_id.to_owned(),
                reason: format!("{err:#}"),
            })
    }

    fn apply_approved(&self, context: &ApprovalContext) -> Option<ApplyOutcome> {
        let request = &context.request;
        match self.applier.apply(request) {
            Ok(outcome) => {
                info!(request_id = %request.id, ?outcome, "Approved change applied");
                self.audit(
                    AuditRecord::new(AuditAction::ChangeApplied, &request.id, "system")
                        .status(request.status)
                        .detail(format!("{outcome:?}")),
                );
                Some(outcome)
            }
            Err(err) => {
                // The approval stands; the payload has to be re-applied.
                error!(
                    request_id = %request.id,
                    entity_type = request.entity_type.as_str(),
                    entity_id = %request.entity_id,
                    payload_digest = %request.payload_digest,
                    error = %format!("{err:#}"),
                    "Approved change could not be applied"
                );
                self.audit(
                    AuditRecord::new(AuditAction::ChangeApplicationFailed, &request.id, "system")
                        .status(request.status)
                        .detail(format!("{err:#}")),
                );
                None
            }
        }
    }

    fn announce_stage(&self, context: &ApprovalContext, order: u32) {
        let Some(stage) = context.stage(order) else {
            return;
        };
        self.dispatch(Notification::StageAssigned {
            request_id: context.request.id.clone(),
            stage_order: order,
            stage_name: stage.name.clone(),
            approver_role_ids: stage.approver_role_ids.clone(),
            approver_user_ids: stage.approver_user_ids.clone(),
        });
    }

    fn announce_resolution(&self, context: &ApprovalContext) {
        self.dispatch(Notification::Resolved {
            request_id: context.request.id.clone(),
            requester_id: context.request.requested_by_id.clone(),
            status: context.request.status,
        });
    }

    fn dispatch(&self, notification: Notification) {
        if let Err(err) = self.notifier.notify(&notification) {
            warn!(request_id = %notification.request_id(), error = %err, "Notification failed");
        }
    }

    fn audit(&self, record: AuditRecord) {
        let request_id = record.request_id.clone();
        if let Err(err) = self.audit.record(record) {
            warn!(%request_id, error = %err, "Audit record could not be written");
        }
    }
}

fn refused(err: &GovernanceError, request_id: &str, actor: &Actor, operation: &str) {
    match err {
        GovernanceError::Authorization(reason) => {
            warn!(request_id, actor_id = %actor.id, operation, %reason, "Policy violation refused")
        }
        other => debug!(request_id, actor_id = %actor.id, operation, error = %other, "Operation refused"),
    }
}

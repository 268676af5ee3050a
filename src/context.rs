//! Approval context: a request together with the workflow snapshot it was
//! bound to, its per-stage executions and the append-only decision log.
//!
//! Every transition here is pure. The engine runs them inside the repository's
//! atomic read-modify-write, so a transition may be evaluated more than once
//! and must not touch anything outside the context.
use chrono::Utc;
use serde::Serialize;

use crate::error::{GovernanceError, Result};
use crate::risk::RiskScore;
use crate::types::{
    Actor, ApprovalAction, DecisionKind, EntityType, Payload, RequestAction, RequestStatus,
    RiskLevel, StageStatus, TimeStamp,
};
use crate::utils::{DECISION_HRP, REQUEST_HRP, new_id};
use crate::workflow::{DEFAULT_SCOPE, WorkflowDefinition, WorkflowStage};

#[derive(Debug, Clone, PartialEq, Serialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub workflow_id: Option<String>,
    #[n(2)]
    pub entity_type: EntityType,
    #[n(3)]
    pub entity_id: String,
    #[n(4)]
    pub action: RequestAction,
    #[n(5)]
    pub requested_by_id: String,
    #[n(6)]
    pub requested_by_name: String,
    #[n(7)]
    pub status: RequestStatus,
    #[n(8)]
    pub current_stage: u32, // 1-based
    #[n(9)]
    pub payload: Payload,
    #[n(10)]
    pub payload_digest: String, // sha256 of the payload as submitted
    #[n(11)]
    pub risk_score: Option<u32>,
    #[n(12)]
    pub risk_level: Option<RiskLevel>,
    #[n(13)]
    pub scope: String,
    #[n(14)]
    pub resolved_by_id: Option<String>,
    #[n(15)]
    pub resolved_by_name: Option<String>,
    #[n(16)]
    pub resolved_at: Option<TimeStamp<Utc>>,
    #[n(17)]
    pub resolution_note: Option<String>,
    #[n(18)]
    pub created_at: TimeStamp<Utc>,
    #[n(19)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub stage_id: String,
    #[n(2)]
    pub stage_order: u32,
    #[n(3)]
    pub status: StageStatus,
    #[n(4)]
    pub approved_count: u32,
    #[n(5)]
    pub rejected_count: u32,
    #[n(6)]
    pub actor_id: Option<String>,
    #[n(7)]
    pub actor_name: Option<String>,
    #[n(8)]
    pub actor_comment: Option<String>,
    #[n(9)]
    pub acted_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub started_at: Option<TimeStamp<Utc>>, // set when the stage goes IN_PROGRESS
}

impl StageExecution {
    fn start(&mut self, now: &TimeStamp<Utc>) {
        self.status = StageStatus::InProgress;
        self.started_at = Some(now.clone());
    }

    fn stamp(&mut self, actor: &Actor, comment: Option<&str>, now: &TimeStamp<Utc>) {
        self.actor_id = Some(actor.id.clone());
        self.actor_name = Some(actor.name.clone());
        self.actor_comment = comment.map(str::to_owned);
        self.acted_at = Some(now.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub stage_order: u32,
    #[n(3)]
    pub actor_id: String,
    #[n(4)]
    pub actor_name: String,
    #[n(5)]
    pub kind: DecisionKind,
    #[n(6)]
    pub comment: Option<String>,
    #[n(7)]
    pub target_user_id: Option<String>, // DELEGATE only
    #[n(8)]
    pub target_stage: Option<u32>, // ESCALATE only
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// What a request asks to change, before any workflow is bound.
#[derive(Debug, Clone)]
pub struct RequestDraft {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: RequestAction,
    pub payload: Payload,
    pub scope: String,
    pub risk_score: Option<RiskScore>,
}

impl RequestDraft {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, action: RequestAction, payload: Payload) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            action,
            payload,
            scope: DEFAULT_SCOPE.to_owned(),
            risk_score: None,
        }
    }
    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
    pub fn with_risk(mut self, risk: RiskScore) -> Self {
        self.risk_score = Some(risk);
        self
    }
}

/// Outcome of an APPROVE or REJECT on the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Approval counted, quorum not yet met.
    QuorumPending { stage: u32, approved: u32, required: u32 },
    /// Stage complete, the next one is now in progress.
    Advanced { from: u32, to: u32 },
    /// Last stage complete, request is terminal APPROVED.
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalContext {
    #[n(0)]
    pub request: ApprovalRequest,
    #[n(1)]
    pub stages: Vec<WorkflowStage>, // snapshot taken at creation
    #[n(2)]
    pub stage_executions: Vec<StageExecution>,
    #[n(3)]
    pub decisions: Vec<ApprovalDecision>,
}

impl ApprovalContext {
    /// Build a fresh context. With a workflow, stage 1 starts IN_PROGRESS and
    /// the rest wait. Without one the single implicit stage is satisfied on
    /// the spot and the request is born APPROVED.
    pub fn open(
        draft: &RequestDraft,
        requester: &Actor,
        workflow: Option<&WorkflowDefinition>,
        now: &TimeStamp<Utc>,
    ) -> Self {
        let request_id = new_id(REQUEST_HRP);
        let risk = draft.risk_score.as_ref();

        let mut request = ApprovalRequest {
            id: request_id.clone(),
            workflow_id: workflow.map(|w| w.id.clone()),
            entity_type: draft.entity_type,
            entity_id: draft.entity_id.clone(),
            action: draft.action,
            requested_by_id: requester.id.clone(),
            requested_by_name: requester.name.clone(),
            status: RequestStatus::Pending,
            current_stage: 1,
            payload: draft.payload.clone(),
            payload_digest: draft.payload.digest(),
            risk_score: risk.map(|r| r.value),
            risk_level: risk.map(|r| r.level),
            scope: draft.scope.clone(),
            resolved_by_id: None,
            resolved_by_name: None,
            resolved_at: None,
            resolution_note: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let stages = workflow.map(|w| w.stages.clone()).unwrap_or_default();
        let stage_executions = stages
            .iter()
            .map(|stage| StageExecution {
                request_id: request_id.clone(),
                stage_id: stage.id.clone(),
                stage_order: stage.order,
                status: if stage.order == 1 {
                    StageStatus::InProgress
                } else {
                    StageStatus::Pending
                },
                approved_count: 0,
                rejected_count: 0,
                actor_id: None,
                actor_name: None,
                actor_comment: None,
                acted_at: None,
                started_at: (stage.order == 1).then(|| now.clone()),
            })
            .collect();

        if workflow.is_none() {
            request.status = RequestStatus::Approved;
            request.resolved_by_id = Some(requester.id.clone());
            request.resolved_by_name = Some(requester.name.clone());
            request.resolved_at = Some(now.clone());
            request.resolution_note = Some("No governing workflow; approved without review".to_owned());
        }

        Self {
            request,
            stages,
            stage_executions,
            decisions: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn is_terminal(&self) -> bool {
        self.request.status.is_terminal()
    }

    pub fn stage(&self, order: u32) -> Option<&WorkflowStage> {
        self.stages.iter().find(|s| s.order == order)
    }

    pub fn current_stage(&self) -> Option<&WorkflowStage> {
        self.stage(self.request.current_stage)
    }

    pub fn execution(&self, order: u32) -> Option<&StageExecution> {
        self.stage_executions.iter().find(|e| e.stage_order == order)
    }

    pub fn current_execution(&self) -> Option<&StageExecution> {
        self.execution(self.request.current_stage)
    }

    fn execution_mut(&mut self, order: u32) -> Option<&mut StageExecution> {
        self.stage_executions
            .iter_mut()
            .find(|e| e.stage_order == order)
    }

    fn delegated_to(&self, user_id: &str, order: u32) -> bool {
        self.decisions.iter().any(|d| {
            d.kind == DecisionKind::Delegate
                && d.stage_order == order
                && d.target_user_id.as_deref() == Some(user_id)
        })
    }

    /// Whether `user_id` (holding `role_ids`) sits in the current stage's
    /// approver set, directly, by role or through delegation.
    pub fn is_current_approver(&self, user_id: &str, role_ids: &[String]) -> bool {
        let order = self.request.current_stage;
        self.stage(order)
            .is_some_and(|stage| stage.names_approver(user_id, role_ids))
            || self.delegated_to(user_id, order)
    }

    fn has_standing(&self, actor: &Actor) -> bool {
        actor.system || self.is_current_approver(&actor.id, &actor.role_ids)
    }

    /// Open requests the user may act on; never their own.
    pub fn awaits(&self, user_id: &str, role_ids: &[String]) -> bool {
        !self.is_terminal()
            && self.request.requested_by_id != user_id
            && self.is_current_approver(user_id, role_ids)
    }

    /// When the current stage times out, if it has a timeout at all.
    pub fn stage_deadline(&self) -> Option<TimeStamp<Utc>> {
        if self.is_terminal() {
            return None;
        }
        let hours = self.current_stage()?.timeout_hours?;
        let execution = self.current_execution()?;
        if execution.status != StageStatus::InProgress {
            return None;
        }
        execution.started_at.as_ref().map(|started| started.plus_hours(hours))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(GovernanceError::StateConflict(format!(
                "request {} is already {:?}",
                self.request.id, self.request.status
            )));
        }
        Ok(())
    }

    fn ensure_not_requester(&self, actor_id: &str, what: &str) -> Result<()> {
        if actor_id == self.request.requested_by_id {
            return Err(GovernanceError::Authorization(format!(
                "the requester cannot {what} their own request"
            )));
        }
        Ok(())
    }

    fn active_stage(&self) -> Result<WorkflowStage> {
        let order = self.request.current_stage;
        let stage = self.stage(order).ok_or_else(|| {
            GovernanceError::StateConflict(format!("stage {order} does not exist on this request"))
        })?;
        match self.execution(order) {
            Some(execution) if execution.status == StageStatus::InProgress => Ok(stage.clone()),
            Some(execution) => Err(GovernanceError::StateConflict(format!(
                "stage {order} is {:?}, not in progress",
                execution.status
            ))),
            None => Err(GovernanceError::StateConflict(format!(
                "stage {order} has no execution record"
            ))),
        }
    }

    fn ensure_standing(&self, actor: &Actor, stage: &WorkflowStage) -> Result<()> {
        if !self.has_standing(actor) {
            return Err(GovernanceError::Authorization(format!(
                "{} is not an approver for stage {} ({})",
                actor.id, stage.order, stage.name
            )));
        }
        Ok(())
    }

    fn log(&mut self, actor: &Actor, kind: DecisionKind, comment: Option<&str>, now: &TimeStamp<Utc>) -> &mut ApprovalDecision {
        self.decisions.push(ApprovalDecision {
            id: new_id(DECISION_HRP),
            request_id: self.request.id.clone(),
            stage_order: self.request.current_stage,
            actor_id: actor.id.clone(),
            actor_name: actor.name.clone(),
            kind,
            comment: comment.map(str::to_owned),
            target_user_id: None,
            target_stage: None,
            created_at: now.clone(),
        });
        let last = self.decisions.len() - 1;
        &mut self.decisions[last]
    }

    fn resolve(&mut self, status: RequestStatus, actor: &Actor, note: Option<&str>, now: &TimeStamp<Utc>) {
        self.request.status = status;
        self.request.resolved_by_id = Some(actor.id.clone());
        self.request.resolved_by_name = Some(actor.name.clone());
        self.request.resolved_at = Some(now.clone());
        self.request.resolution_note = note.map(str::to_owned);
        self.request.updated_at = now.clone();
    }

    /// Apply an APPROVE or REJECT by `actor` to the current stage.
    pub fn record_verdict(
        &mut self,
        actor: &Actor,
        action: ApprovalAction,
        comment: Option<&str>,
        now: &TimeStamp<Utc>,
    ) -> Result<Transition> {
        self.ensure_not_requester(&actor.id, "approve or reject")?;
        self.ensure_open()?;
        let stage = self.active_stage()?;
        self.ensure_standing(actor, &stage)?;

        if stage.require_mfa && !actor.mfa_verified {
            return Err(GovernanceError::Authorization(format!(
                "stage {} requires a multi-factor verified session",
                stage.order
            )));
        }

        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        match action {
            ApprovalAction::Reject if comment.is_none() => {
                return Err(GovernanceError::validation("comment", "a rejection needs a reason"));
            }
            ApprovalAction::Approve if stage.require_comment && comment.is_none() => {
                return Err(GovernanceError::validation(
                    "comment",
                    format!("stage {} requires a comment on approval", stage.order),
                ));
            }
            _ => {}
        }

        let order = stage.order;
        let already_approved = self.decisions.iter().any(|d| {
            d.kind == DecisionKind::Approve && d.stage_order == order && d.actor_id == actor.id
        });
        if action == ApprovalAction::Approve && already_approved {
            return Err(GovernanceError::StateConflict(format!(
                "{} already approved stage {order}",
                actor.id
            )));
        }

        self.log(actor, action.into(), comment, now);
        self.request.updated_at = now.clone();

        let execution = self.execution_mut(order).ok_or_else(|| {
            GovernanceError::StateConflict(format!("stage {order} has no execution record"))
        })?;

        if action == ApprovalAction::Reject {
            execution.rejected_count += 1;
            execution.status = StageStatus::Rejected;
            execution.stamp(actor, comment, now);
            self.resolve(RequestStatus::Rejected, actor, comment, now);
            return Ok(Transition::Rejected);
        }

        execution.approved_count += 1;
        let approved = execution.approved_count;
        let required = stage.required_approvals();

        if approved < required {
            self.request.status = RequestStatus::InProgress;
            return Ok(Transition::QuorumPending {
                stage: order,
                approved,
                required,
            });
        }

        execution.status = StageStatus::Approved;
        execution.stamp(actor, comment, now);

        let next = order + 1;
        match self.execution_mut(next) {
            Some(next_execution) => {
                next_execution.start(now);
                self.request.current_stage = next;
                self.request.status = RequestStatus::InProgress;
                Ok(Transition::Advanced { from: order, to: next })
            }
            None => {
                self.resolve(RequestStatus::Approved, actor, comment, now);
                Ok(Transition::Approved)
            }
        }
    }

    /// Hand the current stage to `target_user_id`. Stage state is untouched;
    /// the delegate still has to approve or reject on their own.
    pub fn delegate(
        &mut self,
        actor: &Actor,
        target_user_id: &str,
        comment: Option<&str>,
        now: &TimeStamp<Utc>,
    ) -> Result<u32> {
        self.ensure_open()?;
        let stage = self.active_stage()?;
        self.ensure_standing(actor, &stage)?;

        let target = target_user_id.trim();
        if target.is_empty() {
            return Err(GovernanceError::validation("targetUserId", "a delegate is required"));
        }
        if target == actor.id {
            return Err(GovernanceError::validation(
                "targetUserId",
                "cannot delegate to yourself",
            ));
        }
        if target == self.request.requested_by_id {
            return Err(GovernanceError::Authorization(
                "cannot delegate a request to its own requester".to_owned(),
            ));
        }

        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        let decision = self.log(actor, DecisionKind::Delegate, comment, now);
        decision.target_user_id = Some(target.to_owned());
        self.request.updated_at = now.clone();

        Ok(stage.order)
    }

    /// Jump to the current stage's escalation target, or the next stage when
    /// none is declared.
    pub fn escalate(&mut self, actor: &Actor, comment: Option<&str>, now: &TimeStamp<Utc>) -> Result<Escalation> {
        if !actor.system {
            self.ensure_not_requester(&actor.id, "escalate")?;
        }
        self.ensure_open()?;
        let stage = self.active_stage()?;
        self.ensure_standing(actor, &stage)?;

        let from = stage.order;
        let to = stage.escalate_to_stage.unwrap_or(from + 1);
        if to <= from || self.execution(to).is_none() {
            return Err(GovernanceError::StateConflict(format!(
                "stage {from} has no escalation target"
            )));
        }

        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        let decision = self.log(actor, DecisionKind::Escalate, comment, now);
        decision.target_stage = Some(to);

        for execution in self.stage_executions.iter_mut() {
            match execution.stage_order {
                o if o == from => {
                    execution.status = StageStatus::Escalated;
                    execution.stamp(actor, comment, now);
                }
                o if o > from && o < to => execution.status = StageStatus::Skipped,
                o if o == to => execution.start(now),
                _ => {}
            }
        }

        self.request.current_stage = to;
        self.request.status = RequestStatus::InProgress;
        self.request.updated_at = now.clone();

        Ok(Escalation { from, to })
    }

    /// Withdraw the request. Only its requester may, only while it is open.
    pub fn cancel(&mut self, requester: &Actor, reason: &str, now: &TimeStamp<Utc>) -> Result<()> {
        if requester.id != self.request.requested_by_id {
            return Err(GovernanceError::Authorization(
                "only the requester may cancel a request".to_owned(),
            ));
        }
        self.ensure_open()?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(GovernanceError::validation("reason", "a cancellation needs a reason"));
        }

        self.resolve(RequestStatus::Cancelled, requester, Some(reason), now);
        Ok(())
    }
}

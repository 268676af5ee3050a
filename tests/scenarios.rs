use anyhow::Context;
use serde_json::json;
use sled::open;
use std::sync::Arc;
use std::thread;

use governance_approval::{
    applier::{ApplyOutcome, Role},
    audit::{AuditAction, InMemoryAuditSink},
    context::RequestDraft,
    engine::ApprovalEngine,
    error::GovernanceError,
    store::{RoleRepository, SledRepository},
    types::{Actor, EntityType, Payload, RequestAction, RequestStatus, StageStatus, TimeStamp},
    workflow::{StageConfig, WorkflowConfig},
};

use tempfile::tempdir; // Use for test db cleanup.

// Sled takes a file lock on its database, so every test opens its own
// database under a temp dir.
fn open_repo(dir: &tempfile::TempDir, name: &str) -> anyhow::Result<Arc<SledRepository>> {
    let db = open(dir.path().join(name))?;
    Ok(Arc::new(SledRepository::new(Arc::new(db))?))
}

fn role_update(role_id: &str, permissions: serde_json::Value) -> RequestDraft {
    RequestDraft::new(
        EntityType::Role,
        role_id,
        RequestAction::Update,
        Payload::new(json!({ "permissions": permissions })),
    )
}

fn requester() -> Actor {
    Actor::new("u-requester", "Rae Requester")
}

#[test]
fn two_stage_role_update_applies_permissions() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "two_stage.db")?;
    repo.put_role(&Role::new("role-support", "Support").with_permissions(&["tickets.read"]))?;

    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Role,
        RequestAction::Update,
        vec![
            StageConfig::sequential("Team lead").approver_roles(&["lead"]),
            StageConfig::sequential("Security").approver_roles(&["security"]),
        ],
    ))?;

    let ctx = engine
        .create(role_update("role-support", json!(["a", "b"])), &requester())
        .context("Request failed on create: ")?;
    assert_eq!(ctx.request.status, RequestStatus::Pending);
    assert_eq!(ctx.request.current_stage, 1);

    let ctx = engine
        .approve(ctx.id(), &Actor::new("u-x", "X").with_roles(["lead"]), None)
        .context("Stage 1 approval failed: ")?;
    assert_eq!(ctx.request.status, RequestStatus::InProgress);
    assert_eq!(ctx.request.current_stage, 2);
    assert_eq!(ctx.stage_executions[0].status, StageStatus::Approved);
    assert_eq!(ctx.stage_executions[1].status, StageStatus::InProgress);

    let ctx = engine
        .approve(ctx.id(), &Actor::new("u-y", "Y").with_roles(["security"]), Some("ok"))
        .context("Stage 2 approval failed: ")?;
    assert_eq!(ctx.request.status, RequestStatus::Approved);
    assert_eq!(ctx.request.resolved_by_id.as_deref(), Some("u-y"));

    let role = repo.get_role("role-support")?.context("role vanished")?;
    assert_eq!(role.permissions, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(role.version, 2);

    // the persisted context matches what the engine handed back
    assert_eq!(engine.get(ctx.id())?, ctx);

    Ok(())
}

#[test]
fn parallel_quorum_applies_once() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "parallel.db")?;
    repo.put_role(&Role::new("role-ops", "Ops"))?;

    let audit = Arc::new(InMemoryAuditSink::new());
    let engine = ApprovalEngine::new(Arc::clone(&repo)).with_audit_sink(audit.clone());
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Role,
        RequestAction::Update,
        vec![StageConfig::parallel("Board", 3).approver_roles(&["board"])],
    ))?;

    let ctx = engine.create(role_update("role-ops", json!(["ops.read"])), &requester())?;

    for member in ["u-b1", "u-b2"] {
        let ctx = engine.approve(ctx.id(), &Actor::new(member, member).with_roles(["board"]), None)?;
        assert_eq!(ctx.request.status, RequestStatus::InProgress);
        assert_eq!(ctx.request.current_stage, 1);
    }

    let ctx = engine.approve(ctx.id(), &Actor::new("u-b3", "B3").with_roles(["board"]), None)?;
    assert_eq!(ctx.request.status, RequestStatus::Approved);
    assert_eq!(ctx.stage_executions[0].approved_count, 3);

    let applied = audit
        .actions_for(ctx.id())
        .into_iter()
        .filter(|a| *a == AuditAction::ChangeApplied)
        .count();
    assert_eq!(applied, 1);
    assert_eq!(repo.get_role("role-ops")?.context("role vanished")?.version, 2);

    Ok(())
}

#[test]
fn concurrent_approvals_advance_exactly_once() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "concurrent.db")?;
    repo.put_role(&Role::new("role-fin", "Finance"))?;

    let audit = Arc::new(InMemoryAuditSink::new());
    let engine = Arc::new(ApprovalEngine::new(Arc::clone(&repo)).with_audit_sink(audit.clone()));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Role,
        RequestAction::Update,
        vec![StageConfig::parallel("Committee", 4).approver_roles(&["committee"])],
    ))?;

    let ctx = engine.create(role_update("role-fin", json!(["billing.read"])), &requester())?;
    let request_id = ctx.id().to_owned();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let request_id = request_id.clone();
            thread::spawn(move || {
                let member = format!("u-c{i}");
                engine.approve(&request_id, &Actor::new(&member, &member).with_roles(["committee"]), None)
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.join().expect("approver thread panicked") {
            Ok(_) => accepted += 1,
            Err(GovernanceError::StateConflict(_)) => {}
            Err(other) => return Err(other.into()),
        }
    }

    let ctx = engine.get(&request_id)?;
    assert_eq!(accepted, 4);
    assert_eq!(ctx.request.status, RequestStatus::Approved);
    assert_eq!(ctx.stage_executions[0].approved_count, 4);
    let approvals = audit
        .actions_for(&request_id)
        .into_iter()
        .filter(|a| *a == AuditAction::RequestApproved)
        .count();
    assert_eq!(approvals, 1);
    assert_eq!(repo.get_role("role-fin")?.context("role vanished")?.version, 2);

    Ok(())
}

#[test]
fn rejection_is_final() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "reject.db")?;
    repo.put_role(&Role::new("role-x", "X"))?;

    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Role,
        RequestAction::Update,
        vec![
            StageConfig::sequential("Lead").approver_roles(&["lead"]),
            StageConfig::sequential("Security").approver_roles(&["security"]),
        ],
    ))?;

    let ctx = engine.create(role_update("role-x", json!(["x.read"])), &requester())?;
    let lead = Actor::new("u-lead", "Lead").with_roles(["lead"]);

    let ctx = engine.reject(ctx.id(), &lead, "scope too wide")?;
    assert_eq!(ctx.request.status, RequestStatus::Rejected);
    assert_eq!(ctx.stage_executions[0].status, StageStatus::Rejected);
    assert_eq!(ctx.stage_executions[1].status, StageStatus::Pending);

    let err = engine
        .approve(ctx.id(), &Actor::new("u-lead2", "Lead 2").with_roles(["lead"]), None)
        .unwrap_err();
    assert!(matches!(err, GovernanceError::StateConflict(_)));
    assert_eq!(engine.get(ctx.id())?, ctx);

    // role untouched
    assert_eq!(repo.get_role("role-x")?.context("role vanished")?.version, 1);

    Ok(())
}

#[test]
fn requester_can_never_approve_own_request() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "four_eyes.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::DataExport,
        RequestAction::Export,
        vec![StageConfig::sequential("Privacy").approver_roles(&["privacy"])],
    ))?;

    let self_approver = Actor::new("u-requester", "Rae Requester").with_roles(["privacy"]);
    let ctx = engine.create(
        RequestDraft::new(
            EntityType::DataExport,
            "export-7",
            RequestAction::Export,
            Payload::new(json!({"dataset": "customers"})),
        ),
        &self_approver,
    )?;

    let err = engine.approve(ctx.id(), &self_approver, None).unwrap_err();
    assert!(matches!(err, GovernanceError::Authorization(_)));
    let err = engine.reject(ctx.id(), &self_approver, "never mind").unwrap_err();
    assert!(matches!(err, GovernanceError::Authorization(_)));

    // requester can still withdraw it, and stays refused afterwards
    engine.cancel(ctx.id(), &self_approver, "filed by mistake")?;
    let err = engine.approve(ctx.id(), &self_approver, None).unwrap_err();
    assert!(matches!(err, GovernanceError::Authorization(_)));

    Ok(())
}

#[test]
fn cancellation_scope() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "cancel.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Billing,
        RequestAction::Delete,
        vec![StageConfig::sequential("Finance").approver_roles(&["finance"])],
    ))?;

    let draft = || RequestDraft::new(EntityType::Billing, "inv-1", RequestAction::Delete, Payload::default());

    let open = engine.create(draft(), &requester())?;
    let err = engine
        .cancel(open.id(), &Actor::new("u-other", "Other"), "not mine")
        .unwrap_err();
    assert!(matches!(err, GovernanceError::Authorization(_)));

    let err = engine.cancel(open.id(), &requester(), "  ").unwrap_err();
    assert!(matches!(err, GovernanceError::Validation { .. }));

    let cancelled = engine.cancel(open.id(), &requester(), "duplicate")?;
    assert_eq!(cancelled.request.status, RequestStatus::Cancelled);
    assert_eq!(cancelled.request.resolution_note.as_deref(), Some("duplicate"));

    let approved = engine.create(draft(), &requester())?;
    engine.approve(approved.id(), &Actor::new("u-fin", "Fin").with_roles(["finance"]), None)?;
    let err = engine.cancel(approved.id(), &requester(), "too late").unwrap_err();
    assert!(matches!(err, GovernanceError::StateConflict(_)));

    Ok(())
}

#[test]
fn delegate_then_escalate() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "delegate.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::User,
        RequestAction::Create,
        vec![
            StageConfig::sequential("Manager").approver_roles(&["manager"]).escalate_to(3),
            StageConfig::sequential("HR").approver_roles(&["hr"]),
            StageConfig::sequential("Director").approver_users(&["u-director"]),
        ],
    ))?;

    let ctx = engine.create(
        RequestDraft::new(EntityType::User, "new-hire-9", RequestAction::Create, Payload::default()),
        &requester(),
    )?;

    let manager = Actor::new("u-manager", "Manager").with_roles(["manager"]);
    let ctx = engine.delegate(ctx.id(), &manager, "u-deputy", Some("on holiday"))?;
    assert_eq!(ctx.request.current_stage, 1);
    assert_eq!(engine.pending_for_user("u-deputy", &[])?.len(), 1);

    let err = engine
        .delegate(ctx.id(), &manager, "u-requester", None)
        .unwrap_err();
    assert!(matches!(err, GovernanceError::Authorization(_)));

    let ctx = engine.escalate(ctx.id(), &Actor::new("u-deputy", "Deputy"), Some("needs director"))?;
    assert_eq!(ctx.request.current_stage, 3);
    let statuses: Vec<_> = ctx.stage_executions.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![StageStatus::Escalated, StageStatus::Skipped, StageStatus::InProgress]
    );

    let ctx = engine.approve(ctx.id(), &Actor::new("u-director", "Director"), None)?;
    assert_eq!(ctx.request.status, RequestStatus::Approved);

    Ok(())
}

#[test]
fn pending_lists_only_actionable_requests() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "pending.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Billing,
        RequestAction::Update,
        vec![
            StageConfig::sequential("Finance").approver_roles(&["finance"]),
            StageConfig::sequential("CFO").approver_users(&["u-cfo"]),
        ],
    ))?;

    let draft = |id: &str| RequestDraft::new(EntityType::Billing, id, RequestAction::Update, Payload::default());
    let first = engine.create(draft("sub-1"), &requester())?;
    let second = engine.create(draft("sub-2"), &requester())?;
    let own = engine.create(draft("sub-3"), &Actor::new("u-fin", "Fin"))?;

    let finance = vec!["finance".to_string()];
    let pending = engine.pending_for_user("u-fin", &finance)?;
    let ids: Vec<&str> = pending.iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![first.id(), second.id()]);
    assert!(!ids.contains(&own.id()));

    engine.approve(first.id(), &Actor::new("u-fin", "Fin").with_roles(["finance"]), None)?;
    assert_eq!(engine.pending_for_user("u-fin", &finance)?.len(), 1);
    assert_eq!(engine.pending_for_user("u-cfo", &[])?.len(), 1);

    Ok(())
}

#[test]
fn request_without_workflow_is_applied_directly() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "no_workflow.db")?;
    repo.put_role(&Role::new("role-free", "Free"))?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));

    let ctx = engine.create(role_update("role-free", json!(["docs.read"])), &requester())?;
    assert_eq!(ctx.request.status, RequestStatus::Approved);
    assert!(ctx.request.workflow_id.is_none());

    let role = repo.get_role("role-free")?.context("role vanished")?;
    assert_eq!(role.permissions, vec!["docs.read".to_string()]);

    // a retry is a no-op for the role adapter
    assert_eq!(engine.retry_application(ctx.id())?, ApplyOutcome::AlreadyApplied);
    assert_eq!(repo.get_role("role-free")?.context("role vanished")?.version, 2);

    Ok(())
}

#[test]
fn retry_application_after_role_appears() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "retry.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Role,
        RequestAction::Update,
        vec![StageConfig::sequential("Lead").approver_roles(&["lead"])],
    ))?;

    let ctx = engine.create(role_update("role-late", json!(["a"])), &requester())?;
    let err = engine.retry_application(ctx.id()).unwrap_err();
    assert!(matches!(err, GovernanceError::StateConflict(_)));

    // approval stands even though the role does not exist yet
    let ctx = engine.approve(ctx.id(), &Actor::new("u-lead", "Lead").with_roles(["lead"]), None)?;
    assert_eq!(ctx.request.status, RequestStatus::Approved);

    repo.put_role(&Role::new("role-late", "Late"))?;
    let outcome = engine.retry_application(ctx.id())?;
    assert_eq!(
        outcome,
        ApplyOutcome::RoleUpdated { role_id: "role-late".into(), version: 2 }
    );

    Ok(())
}

#[test]
fn retrying_an_earlier_request_keeps_the_later_change() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "stale-retry.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::Role,
        RequestAction::Update,
        vec![StageConfig::sequential("Lead").approver_roles(&["lead"])],
    ))?;
    repo.put_role(&Role::new("role-1", "Ops"))?;
    let lead = Actor::new("u-lead", "Lead").with_roles(["lead"]);

    let first = engine.create(role_update("role-1", json!(["a"])), &requester())?;
    engine.approve(first.id(), &lead, None)?;
    let second = engine.create(role_update("role-1", json!(["b"])), &requester())?;
    engine.approve(second.id(), &lead, None)?;

    let role = repo.get_role("role-1")?.context("role exists")?;
    assert_eq!(role.permissions, vec!["b".to_string()]);
    assert_eq!(role.version, 3);

    assert_eq!(engine.retry_application(first.id())?, ApplyOutcome::AlreadyApplied);
    assert_eq!(engine.retry_application(second.id())?, ApplyOutcome::AlreadyApplied);
    assert_eq!(repo.get_role("role-1")?, Some(role));

    Ok(())
}

#[test]
fn sweep_escalates_overdue_stages() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "sweep.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    engine.workflows().upsert(&WorkflowConfig::new(
        EntityType::DataExport,
        RequestAction::Export,
        vec![
            StageConfig::sequential("Privacy").approver_roles(&["privacy"]).timeout_hours(24),
            StageConfig::sequential("DPO").approver_users(&["u-dpo"]),
        ],
    ))?;

    let ctx = engine.create(
        RequestDraft::new(EntityType::DataExport, "exp-1", RequestAction::Export, Payload::default()),
        &requester(),
    )?;

    assert!(engine.overdue_stages(&TimeStamp::new())?.is_empty());

    let later = TimeStamp::new().plus_hours(25);
    let overdue = engine.overdue_stages(&later)?;
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].stage_order, 1);

    let report = engine.sweep_overdue(&later)?;
    assert_eq!(report.escalated.len(), 1);
    assert_eq!(report.skipped, 0);

    let ctx = engine.get(ctx.id())?;
    assert_eq!(ctx.request.current_stage, 2);
    assert_eq!(ctx.stage_executions[0].status, StageStatus::Escalated);
    assert_eq!(ctx.decisions[0].actor_id, "system:stage-timeout");

    // last stage has no timeout, so nothing more to do
    assert!(engine.sweep_overdue(&later.plus_hours(100))?.escalated.is_empty());

    Ok(())
}

#[test]
fn in_flight_requests_keep_their_stage_snapshot() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let repo = open_repo(&temp_dir, "snapshot.db")?;
    let engine = ApprovalEngine::new(Arc::clone(&repo));
    let config = |stages| WorkflowConfig::new(EntityType::Billing, RequestAction::Create, stages);

    engine.workflows().upsert(&config(vec![
        StageConfig::sequential("Finance").approver_roles(&["finance"]),
    ]))?;
    let ctx = engine.create(
        RequestDraft::new(EntityType::Billing, "inv-2", RequestAction::Create, Payload::default()),
        &requester(),
    )?;

    engine.workflows().upsert(&config(vec![
        StageConfig::sequential("Finance").approver_roles(&["finance"]),
        StageConfig::sequential("Audit").approver_roles(&["audit"]),
    ]))?;

    let ctx = engine.approve(ctx.id(), &Actor::new("u-fin", "Fin").with_roles(["finance"]), None)?;
    assert_eq!(ctx.request.status, RequestStatus::Approved);
    assert_eq!(engine.workflows().list()?.len(), 1);

    Ok(())
}

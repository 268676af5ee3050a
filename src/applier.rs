//! Adapters that carry an approved change into the entity it targets.
//!
//! Appliers run after the request is already APPROVED and may run again for
//! the same request (retries, at-least-once delivery), so each adapter must
//! be idempotent against one approved payload.
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use chrono::Utc;
use tracing::{info, warn};

use crate::context::ApprovalRequest;
use crate::store::RoleRepository;
use crate::types::{EntityType, RequestAction, TimeStamp};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    PendingApproval,
    #[n(2)]
    Active,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub permissions: Vec<String>,
    #[n(3)]
    pub status: RoleStatus,
    #[n(4)]
    pub version: u64, // optimistic concurrency counter
    /// Every approved request already written into this role.
    #[n(5)]
    pub applied_requests: Vec<String>,
    /// Resolution time of the newest request written into this role.
    #[n(6)]
    pub applied_resolution: Option<TimeStamp<Utc>>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            permissions: vec![],
            status: RoleStatus::Draft,
            version: 1,
            applied_requests: vec![],
            applied_resolution: None,
        }
    }
    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| (*p).to_owned()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    RoleUpdated { role_id: String, version: u64 },
    /// The same approved request was already applied; nothing changed.
    AlreadyApplied,
    /// A request resolved later has already been written; nothing changed.
    Superseded,
    UserProvisioned { user_id: String },
    /// No adapter is registered for this entity/action pair.
    NoAdapter,
}

pub trait ChangeApplier: Send + Sync {
    fn apply(&self, request: &ApprovalRequest) -> anyhow::Result<ApplyOutcome>;
}

/// Port to the user provisioning subsystem.
pub trait UserProvisioner: Send + Sync {
    fn provision(&self, request: &ApprovalRequest) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct LoggingUserProvisioner;

impl UserProvisioner for LoggingUserProvisioner {
    fn provision(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        info!(
            request_id = %request.id,
            user_id = %request.entity_id,
            action = request.action.as_str(),
            "User provisioning handed off"
        );
        Ok(())
    }
}

/// Replaces a role's permission set with the approved one.
pub struct RoleChangeApplier<R> {
    roles: Arc<R>,
}

impl<R: RoleRepository> RoleChangeApplier<R> {
    pub fn new(roles: Arc<R>) -> Self {
        Self { roles }
    }

    pub fn apply(&self, request: &ApprovalRequest) -> anyhow::Result<ApplyOutcome> {
        let mut permissions = request
            .payload
            .permissions()?
            .context("role update payload carries no permissions list")?;
        permissions.sort();
        permissions.dedup();

        let resolved_at = request.resolved_at.as_ref().unwrap_or(&request.updated_at);
        let (role, outcome) = self
            .roles
            .update_role_atomically(&request.entity_id, |role| {
                if role.applied_requests.iter().any(|id| *id == request.id) {
                    return Ok(Some(ApplyOutcome::AlreadyApplied));
                }
                if role.applied_resolution.as_ref().is_some_and(|last| last > resolved_at) {
                    return Ok(Some(ApplyOutcome::Superseded));
                }
                role.permissions = permissions.clone();
                role.status = RoleStatus::Active;
                role.version += 1;
                role.applied_requests.push(request.id.clone());
                role.applied_resolution = Some(resolved_at.clone());
                Ok(None)
            })
            .with_context(|| format!("updating role {}", request.entity_id))?;

        if let Some(outcome) = outcome {
            if outcome == ApplyOutcome::Superseded {
                warn!(
                    request_id = %request.id,
                    role_id = %role.id,
                    "Role already carries a later approved change; stale request not applied"
                );
            }
            return Ok(outcome);
        }

        info!(
            role_id = %role.id,
            version = role.version,
            permissions = role.permissions.len(),
            "Role permissions replaced"
        );

        Ok(ApplyOutcome::RoleUpdated {
            role_id: role.id,
            version: role.version,
        })
    }
}

/// Dispatches on the request's entity type and action.
pub struct DefaultChangeApplier<R> {
    roles: RoleChangeApplier<R>,
    users: Arc<dyn UserProvisioner>,
}

impl<R: RoleRepository> DefaultChangeApplier<R> {
    pub fn new(roles: Arc<R>) -> Self {
        Self {
            roles: RoleChangeApplier::new(roles),
            users: Arc::new(LoggingUserProvisioner),
        }
    }

    pub fn with_user_provisioner(mut self, users: Arc<dyn UserProvisioner>) -> Self {
        self.users = users;
        self
    }
}

impl<R: RoleRepository> ChangeApplier for DefaultChangeApplier<R> {
    fn apply(&self, request: &ApprovalRequest) -> anyhow::Result<ApplyOutcome> {
        match (request.entity_type, request.action) {
            (EntityType::Role, RequestAction::Update) => self.roles.apply(request),
            (EntityType::User, _) => {
                self.users.provision(request)?;
                Ok(ApplyOutcome::UserProvisioned {
                    user_id: request.entity_id.clone(),
                })
            }
            _ => Ok(ApplyOutcome::NoAdapter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ApprovalContext, RequestDraft};
    use crate::store::InMemoryRepository;
    use crate::types::{Actor, Payload, TimeStamp};
    use serde_json::json;

    fn approved_role_update(role_id: &str, permissions: serde_json::Value) -> ApprovalRequest {
        let draft = RequestDraft::new(
            EntityType::Role,
            role_id,
            RequestAction::Update,
            Payload::new(json!({ "permissions": permissions })),
        );
        ApprovalContext::open(&draft, &Actor::new("u-req", "Requester"), None, &TimeStamp::new()).request
    }

    #[test]
    fn replaces_permissions_and_bumps_version_once() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.put_role(&Role::new("role-1", "Auditor").with_permissions(&["old.perm"]))
            .unwrap();
        let applier = DefaultChangeApplier::new(Arc::clone(&repo));
        let request = approved_role_update("role-1", json!(["b", "a", "a"]));

        let first = applier.apply(&request).unwrap();
        assert_eq!(
            first,
            ApplyOutcome::RoleUpdated { role_id: "role-1".into(), version: 2 }
        );

        let again = applier.apply(&request).unwrap();
        assert_eq!(again, ApplyOutcome::AlreadyApplied);

        let role = repo.get_role("role-1").unwrap().unwrap();
        assert_eq!(role.permissions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(role.status, RoleStatus::Active);
        assert_eq!(role.version, 2);
    }

    #[test]
    fn older_approval_never_overwrites_a_newer_one() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.put_role(&Role::new("role-1", "Auditor")).unwrap();
        let applier = DefaultChangeApplier::new(Arc::clone(&repo));

        let mut older = approved_role_update("role-1", json!(["old"]));
        older.resolved_at = TimeStamp::new_with(2026, 3, 1, 9, 0, 0);
        let mut newer = approved_role_update("role-1", json!(["new"]));
        newer.resolved_at = TimeStamp::new_with(2026, 3, 2, 9, 0, 0);

        applier.apply(&newer).unwrap();
        assert_eq!(applier.apply(&older).unwrap(), ApplyOutcome::Superseded);

        let role = repo.get_role("role-1").unwrap().unwrap();
        assert_eq!(role.permissions, vec!["new".to_string()]);
        assert_eq!(role.version, 2);
        assert_eq!(role.applied_requests, vec![newer.id.clone()]);
    }

    #[test]
    fn missing_role_is_an_error() {
        let repo = Arc::new(InMemoryRepository::new());
        let applier = DefaultChangeApplier::new(repo);

        assert!(applier.apply(&approved_role_update("ghost", json!(["a"]))).is_err());
    }

    struct RefusingProvisioner;

    impl UserProvisioner for RefusingProvisioner {
        fn provision(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
            anyhow::bail!("directory rejected {}", request.entity_id)
        }
    }

    #[test]
    fn user_changes_go_to_the_provisioner() {
        let repo = Arc::new(InMemoryRepository::new());
        let draft = RequestDraft::new(EntityType::User, "u-new", RequestAction::Create, Payload::default());
        let request =
            ApprovalContext::open(&draft, &Actor::new("u-req", "Requester"), None, &TimeStamp::new()).request;

        let logging = DefaultChangeApplier::new(Arc::clone(&repo));
        assert_eq!(
            logging.apply(&request).unwrap(),
            ApplyOutcome::UserProvisioned { user_id: "u-new".into() }
        );

        let refusing = DefaultChangeApplier::new(repo).with_user_provisioner(Arc::new(RefusingProvisioner));
        let err = refusing.apply(&request).unwrap_err();
        assert!(err.to_string().contains("u-new"));
    }

    #[test]
    fn unsupported_pairs_have_no_adapter() {
        let repo = Arc::new(InMemoryRepository::new());
        let applier = DefaultChangeApplier::new(repo);
        let draft = RequestDraft::new(
            EntityType::Billing,
            "inv-9",
            RequestAction::Delete,
            Payload::default(),
        );
        let request =
            ApprovalContext::open(&draft, &Actor::new("u-req", "Requester"), None, &TimeStamp::new()).request;

        assert_eq!(applier.apply(&request).unwrap(), ApplyOutcome::NoAdapter);
    }
}

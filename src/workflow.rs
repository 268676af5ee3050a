//! Workflow definitions: which approval stages a kind of change must pass.
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GovernanceError, Result};
use crate::store::ApprovalRepository;
use crate::types::{ApprovalType, EntityType, RequestAction, TimeStamp};
use crate::utils::{STAGE_HRP, WORKFLOW_HRP, new_id};

/// Scope consulted when no definition exists for the requested scope.
pub const DEFAULT_SCOPE: &str = "global";

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStage {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub workflow_id: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub order: u32, // 1-based, dense
    #[n(4)]
    pub approval_type: ApprovalType,
    #[n(5)]
    pub required_count: u32,
    #[n(6)]
    pub approver_role_ids: Vec<String>,
    #[n(7)]
    pub approver_user_ids: Vec<String>,
    #[n(8)]
    pub timeout_hours: Option<u32>,
    #[n(9)]
    pub escalate_to_stage: Option<u32>,
    #[n(10)]
    pub require_mfa: bool,
    #[n(11)]
    pub require_comment: bool,
}

impl WorkflowStage {
    /// Approvals needed before the stage completes. Sequential stages complete
    /// on the first one whatever `required_count` says.
    pub fn required_approvals(&self) -> u32 {
        match self.approval_type {
            ApprovalType::Sequential => 1,
            ApprovalType::Parallel => self.required_count.max(1),
        }
    }

    pub fn names_approver(&self, user_id: &str, role_ids: &[String]) -> bool {
        self.approver_user_ids.iter().any(|id| id == user_id)
            || self
                .approver_role_ids
                .iter()
                .any(|role| role_ids.contains(role))
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub entity_type: EntityType,
    #[n(2)]
    pub action: RequestAction,
    #[n(3)]
    pub scope: String,
    #[n(4)]
    pub is_active: bool,
    #[n(5)]
    pub priority: i32,
    #[n(6)]
    pub risk_threshold: Option<u32>,
    #[n(7)]
    pub stages: Vec<WorkflowStage>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl WorkflowDefinition {
    pub fn key(&self) -> String {
        workflow_key(self.entity_type, self.action, &self.scope)
    }

    fn admits_risk(&self, risk_value: Option<u32>) -> bool {
        match (self.risk_threshold, risk_value) {
            (Some(threshold), Some(value)) => value >= threshold,
            (Some(threshold), None) => threshold == 0,
            (None, _) => true,
        }
    }
}

/// Storage key for the `(entityType, action, scope)` triple.
pub fn workflow_key(entity_type: EntityType, action: RequestAction, scope: &str) -> String {
    format!("{}|{}|{}", entity_type.as_str(), action.as_str(), scope)
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_required_count() -> u32 {
    1
}

fn default_approval_type() -> ApprovalType {
    ApprovalType::Sequential
}

/// Input for [`WorkflowStore::upsert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub entity_type: EntityType,
    pub action: RequestAction,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub risk_threshold: Option<u32>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub name: String,
    #[serde(default = "default_approval_type")]
    pub approval_type: ApprovalType,
    #[serde(default = "default_required_count")]
    pub required_count: u32,
    #[serde(default)]
    pub approver_role_ids: Vec<String>,
    #[serde(default)]
    pub approver_user_ids: Vec<String>,
    #[serde(default)]
    pub timeout_hours: Option<u32>,
    #[serde(default)]
    pub escalate_to_stage: Option<u32>,
    #[serde(default)]
    pub require_mfa: bool,
    #[serde(default)]
    pub require_comment: bool,
}

impl StageConfig {
    pub fn sequential(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            approval_type: ApprovalType::Sequential,
            required_count: 1,
            approver_role_ids: vec![],
            approver_user_ids: vec![],
            timeout_hours: None,
            escalate_to_stage: None,
            require_mfa: false,
            require_comment: false,
        }
    }
    pub fn parallel(name: &str, required_count: u32) -> Self {
        Self {
            approval_type: ApprovalType::Parallel,
            required_count,
            ..Self::sequential(name)
        }
    }
    pub fn approver_roles(mut self, roles: &[&str]) -> Self {
        self.approver_role_ids = roles.iter().map(|r| (*r).to_owned()).collect();
        self
    }
    pub fn approver_users(mut self, users: &[&str]) -> Self {
        self.approver_user_ids = users.iter().map(|u| (*u).to_owned()).collect();
        self
    }
    pub fn timeout_hours(mut self, hours: u32) -> Self {
        self.timeout_hours = Some(hours);
        self
    }
    pub fn escalate_to(mut self, stage: u32) -> Self {
        self.escalate_to_stage = Some(stage);
        self
    }
    pub fn require_mfa(mut self) -> Self {
        self.require_mfa = true;
        self
    }
    pub fn require_comment(mut self) -> Self {
        self.require_comment = true;
        self
    }
}

impl WorkflowConfig {
    pub fn new(entity_type: EntityType, action: RequestAction, stages: Vec<StageConfig>) -> Self {
        Self {
            entity_type,
            action,
            scope: default_scope(),
            is_active: true,
            priority: 0,
            risk_threshold: None,
            stages,
        }
    }

    pub fn key(&self) -> String {
        workflow_key(self.entity_type, self.action, &self.scope)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scope.trim().is_empty() {
            return Err(GovernanceError::validation("scope", "scope must not be empty"));
        }
        if self.stages.is_empty() {
            return Err(GovernanceError::validation(
                "stages",
                "a workflow needs at least one stage",
            ));
        }

        let stage_count = self.stages.len() as u32;
        for (index, stage) in self.stages.iter().enumerate() {
            let order = index as u32 + 1;
            let field = |name: &str| format!("stages[{index}].{name}");

            if stage.name.trim().is_empty() {
                return Err(GovernanceError::validation(field("name"), "stage name must not be empty"));
            }
            if stage.required_count == 0 {
                return Err(GovernanceError::validation(
                    field("requiredCount"),
                    "required count must be at least 1",
                ));
            }
            if stage.approver_role_ids.is_empty() && stage.approver_user_ids.is_empty() {
                return Err(GovernanceError::validation(
                    field("approverRoleIds"),
                    "a stage must name at least one approver role or user",
                ));
            }
            if stage.timeout_hours == Some(0) {
                return Err(GovernanceError::validation(
                    field("timeoutHours"),
                    "timeout must be at least one hour",
                ));
            }
            if let Some(target) = stage.escalate_to_stage {
                if target <= order || target > stage_count {
                    return Err(GovernanceError::validation(
                        field("escalateToStage"),
                        format!("escalation target must be a later stage between {} and {stage_count}", order + 1),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Materialise the definition, reusing identity and creation time from
    /// `existing`. Stages are always rebuilt from scratch.
    fn build(&self, existing: Option<&WorkflowDefinition>, now: &TimeStamp<Utc>) -> WorkflowDefinition {
        let id = existing
            .map(|d| d.id.clone())
            .unwrap_or_else(|| new_id(WORKFLOW_HRP));
        let created_at = existing
            .map(|d| d.created_at.clone())
            .unwrap_or_else(|| now.clone());

        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| WorkflowStage {
                id: new_id(STAGE_HRP),
                workflow_id: id.clone(),
                name: stage.name.trim().to_owned(),
                order: index as u32 + 1,
                approval_type: stage.approval_type,
                required_count: stage.required_count,
                approver_role_ids: stage.approver_role_ids.clone(),
                approver_user_ids: stage.approver_user_ids.clone(),
                timeout_hours: stage.timeout_hours,
                escalate_to_stage: stage.escalate_to_stage,
                require_mfa: stage.require_mfa,
                require_comment: stage.require_comment,
            })
            .collect();

        WorkflowDefinition {
            id,
            entity_type: self.entity_type,
            action: self.action,
            scope: self.scope.clone(),
            is_active: self.is_active,
            priority: self.priority,
            risk_threshold: self.risk_threshold,
            stages,
            created_at,
            updated_at: now.clone(),
        }
    }
}

pub struct WorkflowStore<R> {
    repo: Arc<R>,
}

impl<R> Clone for WorkflowStore<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: ApprovalRepository> WorkflowStore<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Create or fully replace the definition for the config's triple.
    pub fn upsert(&self, config: &WorkflowConfig) -> Result<WorkflowDefinition> {
        config.validate()?;

        let now = TimeStamp::new();
        let definition = self
            .repo
            .upsert_workflow(&config.key(), |existing| config.build(existing, &now))?;

        info!(
            workflow_id = %definition.id,
            key = %definition.key(),
            stages = definition.stages.len(),
            "Workflow definition stored"
        );

        Ok(definition)
    }

    pub fn get(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.repo
            .list_workflows()?
            .into_iter()
            .find(|d| d.id == workflow_id)
            .ok_or_else(|| GovernanceError::not_found("workflow", workflow_id))
    }

    pub fn list(&self) -> Result<Vec<WorkflowDefinition>> {
        self.repo.list_workflows()
    }

    /// Active definition for the triple, ignoring risk thresholds.
    pub fn resolve(
        &self,
        entity_type: EntityType,
        action: RequestAction,
        scope: &str,
    ) -> Result<Option<WorkflowDefinition>> {
        self.pick(entity_type, action, scope, |_| true)
    }

    /// Active definition whose risk threshold admits `risk_value`.
    pub fn resolve_for_risk(
        &self,
        entity_type: EntityType,
        action: RequestAction,
        scope: &str,
        risk_value: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>> {
        self.pick(entity_type, action, scope, |d| d.admits_risk(risk_value))
    }

    fn pick<F>(
        &self,
        entity_type: EntityType,
        action: RequestAction,
        scope: &str,
        admits: F,
    ) -> Result<Option<WorkflowDefinition>>
    where
        F: Fn(&WorkflowDefinition) -> bool,
    {
        let candidates: Vec<WorkflowDefinition> = self
            .repo
            .list_workflows()?
            .into_iter()
            .filter(|d| d.is_active && d.entity_type == entity_type && d.action == action)
            .filter(|d| admits(d))
            .collect();

        let best_in = |scope: &str| {
            candidates
                .iter()
                .filter(|d| d.scope == scope)
                .max_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                })
                .cloned()
        };

        Ok(best_in(scope).or_else(|| {
            if scope == DEFAULT_SCOPE {
                None
            } else {
                best_in(DEFAULT_SCOPE)
            }
        }))
    }
}

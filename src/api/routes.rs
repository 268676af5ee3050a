//! Governance and workflow endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::identity::Identity;
use super::state::AppState;
use crate::context::{ApprovalContext, ApprovalDecision, ApprovalRequest, RequestDraft, StageExecution};
use crate::governance::ValidationReport;
use crate::sod::SodRule;
use crate::store::GovernanceStore;
use crate::types::{ApprovalAction, EntityType, Payload, RequestAction};
use crate::workflow::{WorkflowConfig, WorkflowDefinition};

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestBody {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: RequestAction,
    #[serde(default)]
    pub payload: Payload,
    /// Caller-declared score; the higher of this and the computed one wins.
    pub risk_score: Option<u32>,
    pub scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CommentBody {
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RejectBody {
    pub comment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateBody {
    pub target_user_id: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelBody {
    pub reason: String,
}

/// An approval request with its stage executions nested.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestView {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub stage_executions: Vec<StageExecution>,
    pub decisions: Vec<ApprovalDecision>,
}

impl From<ApprovalContext> for ApprovalRequestView {
    fn from(context: ApprovalContext) -> Self {
        Self {
            request: context.request,
            stage_executions: context.stage_executions,
            decisions: context.decisions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Pure SoD and risk evaluation; nothing is persisted.
pub async fn validate<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    _identity: Identity,
    Json(body): Json<ValidateBody>,
) -> Json<ValidationReport> {
    Json(state.engine.validator().validate(&body.permissions))
}

pub async fn sod_rules<R: GovernanceStore>(State(state): State<AppState<R>>) -> Json<Vec<SodRule>> {
    Json(state.engine.validator().sod_rules().rules().to_vec())
}

pub async fn create_request<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(requester): Identity,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<ApprovalRequestView>), ApiError> {
    let mut draft = RequestDraft::new(body.entity_type, body.entity_id, body.action, body.payload);
    if let Some(scope) = body.scope {
        draft = draft.in_scope(scope);
    }
    if let Some(value) = body.risk_score {
        draft = draft.with_risk(state.engine.validator().risk_scorer().declared(value));
    }

    let context = state.blocking(move |engine| engine.create(draft, &requester)).await?;
    Ok((StatusCode::CREATED, Json(context.into())))
}

pub async fn get_request<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    _identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<ApprovalRequestView>, ApiError> {
    let context = state.blocking(move |engine| engine.get(&id)).await?;
    Ok(Json(context.into()))
}

pub async fn pending<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(actor): Identity,
) -> Result<Json<Vec<ApprovalRequestView>>, ApiError> {
    let pending = state
        .blocking(move |engine| engine.pending_for_user(&actor.id, &actor.role_ids))
        .await?;
    Ok(Json(pending.into_iter().map(Into::into).collect()))
}

pub async fn approve<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(actor): Identity,
    Path(id): Path<String>,
    body: Option<Json<CommentBody>>,
) -> Result<Json<ApprovalRequestView>, ApiError> {
    let comment = body.and_then(|Json(b)| b.comment);
    let context = state
        .blocking(move |engine| {
            engine.process_approval_action(&id, &actor, ApprovalAction::Approve, comment.as_deref())
        })
        .await?;
    Ok(Json(context.into()))
}

pub async fn reject<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(actor): Identity,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<ApprovalRequestView>, ApiError> {
    let context = state
        .blocking(move |engine| {
            engine.process_approval_action(&id, &actor, ApprovalAction::Reject, Some(&body.comment))
        })
        .await?;
    Ok(Json(context.into()))
}

pub async fn delegate<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(actor): Identity,
    Path(id): Path<String>,
    Json(body): Json<DelegateBody>,
) -> Result<Json<ApprovalRequestView>, ApiError> {
    let context = state
        .blocking(move |engine| engine.delegate(&id, &actor, &body.target_user_id, body.comment.as_deref()))
        .await?;
    Ok(Json(context.into()))
}

pub async fn escalate<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(actor): Identity,
    Path(id): Path<String>,
    body: Option<Json<CommentBody>>,
) -> Result<Json<ApprovalRequestView>, ApiError> {
    let comment = body.and_then(|Json(b)| b.comment);
    let context = state
        .blocking(move |engine| engine.escalate(&id, &actor, comment.as_deref()))
        .await?;
    Ok(Json(context.into()))
}

pub async fn cancel<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    Identity(requester): Identity,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<ApprovalRequestView>, ApiError> {
    let context = state
        .blocking(move |engine| engine.cancel(&id, &requester, &body.reason))
        .await?;
    Ok(Json(context.into()))
}

pub async fn upsert_definition<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    _identity: Identity,
    Json(config): Json<WorkflowConfig>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let definition = state
        .blocking(move |engine| engine.workflows().upsert(&config))
        .await?;
    Ok(Json(definition))
}

pub async fn list_definitions<R: GovernanceStore>(
    State(state): State<AppState<R>>,
    _identity: Identity,
) -> Result<Json<Vec<WorkflowDefinition>>, ApiError> {
    Ok(Json(state.blocking(|engine| engine.workflows().list()).await?))
}

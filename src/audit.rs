//! Audit sink port. The engine emits one record per state-changing operation;
//! storing them is someone else's job.
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::types::{RequestStatus, TimeStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    RequestCreated,
    StageApproved,
    StageAdvanced,
    RequestApproved,
    RequestRejected,
    RequestDelegated,
    RequestEscalated,
    RequestCancelled,
    ChangeApplied,
    ChangeApplicationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub action: AuditAction,
    pub request_id: String,
    pub actor_id: String,
    pub status: Option<RequestStatus>,
    pub stage_order: Option<u32>,
    pub detail: Option<String>,
    pub recorded_at: TimeStamp<Utc>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, request_id: &str, actor_id: &str) -> Self {
        Self {
            action,
            request_id: request_id.to_owned(),
            actor_id: actor_id.to_owned(),
            status: None,
            stage_order: None,
            detail: None,
            recorded_at: TimeStamp::new(),
        }
    }
    pub fn status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn stage(mut self, order: u32) -> Self {
        self.stage_order = Some(order);
        self
    }
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord) -> anyhow::Result<()>;
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        info!(
            target: "audit",
            action = ?record.action,
            request_id = %record.request_id,
            actor_id = %record.actor_id,
            status = ?record.status,
            stage = ?record.stage_order,
            detail = record.detail.as_deref().unwrap_or(""),
            "Audit record"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions_for(&self, request_id: &str) -> Vec<AuditAction> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.request_id == request_id)
            .map(|r| r.action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

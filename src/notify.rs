//! Notification dispatch port. Delivery (email, push) lives elsewhere; the
//! engine fires and forgets, logging any failure.
use parking_lot::Mutex;
use tracing::info;

use crate::types::RequestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A stage became actionable for its approvers.
    StageAssigned {
        request_id: String,
        stage_order: u32,
        stage_name: String,
        approver_role_ids: Vec<String>,
        approver_user_ids: Vec<String>,
    },
    Delegated {
        request_id: String,
        stage_order: u32,
        from_user_id: String,
        target_user_id: String,
    },
    /// The request reached a terminal state; goes to the requester.
    Resolved {
        request_id: String,
        requester_id: String,
        status: RequestStatus,
    },
}

impl Notification {
    pub fn request_id(&self) -> &str {
        match self {
            Notification::StageAssigned { request_id, .. }
            | Notification::Delegated { request_id, .. }
            | Notification::Resolved { request_id, .. } => request_id,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(request_id = %notification.request_id(), ?notification, "Notification queued");
        Ok(())
    }
}

/// Keeps every notification in memory. Useful to assert on in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

use std::sync::Arc;

use super::error::ApiError;
use crate::engine::ApprovalEngine;
use crate::store::GovernanceStore;

/// Shared application state.
pub struct AppState<R> {
    pub engine: Arc<ApprovalEngine<R>>,
}

impl<R> AppState<R> {
    pub fn new(engine: ApprovalEngine<R>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<R: GovernanceStore> AppState<R> {
    /// Runs an engine call on the blocking pool. Engine calls commit sled
    /// transactions, which may wait on disk.
    pub async fn blocking<T, F>(&self, call: F) -> Result<T, ApiError>
    where
        F: FnOnce(&ApprovalEngine<R>) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || call(&engine))
            .await
            .map_err(|err| ApiError::Internal(format!("engine task failed: {err}")))?
            .map_err(ApiError::from)
    }
}

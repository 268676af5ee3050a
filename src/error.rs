//! Error taxonomy for the governance engine

/// Coarse classification used by callers that need to react to a failure
/// (e.g. the HTTP layer picking a status code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    Authorization,
    NotFound,
    ApplierFailure,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum GovernanceError {
    #[error("Invalid `{field}`: {message}")]
    Validation { field: String, message: String },
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Not authorized: {0}")]
    Authorization(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Change application failed for approved request `{request_id}`: {reason}")]
    ApplierFailure { request_id: String, reason: String },
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Encoding failure: {0}")]
    Codec(String),
}

pub type Result<T, E = GovernanceError> = std::result::Result<T, E>;

impl GovernanceError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GovernanceError::Validation { .. } => ErrorKind::Validation,
            GovernanceError::StateConflict(_) => ErrorKind::StateConflict,
            GovernanceError::Authorization(_) => ErrorKind::Authorization,
            GovernanceError::NotFound { .. } => ErrorKind::NotFound,
            GovernanceError::ApplierFailure { .. } => ErrorKind::ApplierFailure,
            GovernanceError::Storage(_) | GovernanceError::Codec(_) => ErrorKind::Internal,
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for GovernanceError {
    fn from(err: minicbor::encode::Error<E>) -> Self {
        GovernanceError::Codec(err.to_string())
    }
}

impl From<minicbor::decode::Error> for GovernanceError {
    fn from(err: minicbor::decode::Error) -> Self {
        GovernanceError::Codec(err.to_string())
    }
}

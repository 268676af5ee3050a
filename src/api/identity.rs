//! Caller identity, as forwarded by the session layer in front of this
//! service.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};

use super::error::ApiError;
use crate::types::Actor;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const USER_ROLES_HEADER: &str = "x-user-roles";
pub const MFA_HEADER: &str = "x-mfa-verified";

/// Extractor for the acting user. Rejects with 401 when no user id is present.
///
/// ```ignore
/// async fn handler(Identity(actor): Identity) -> impl IntoResponse {
///     format!("Hello, {}!", actor.name)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Identity(pub Actor);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = header(headers, USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing caller identity".to_string()))?;
        let name = header(headers, USER_NAME_HEADER).unwrap_or(user_id);

        let roles: Vec<&str> = header(headers, USER_ROLES_HEADER)
            .map(|raw| raw.split(',').map(str::trim).filter(|r| !r.is_empty()).collect())
            .unwrap_or_default();
        let mfa = header(headers, MFA_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(Identity(
            Actor::new(user_id, name).with_roles(roles).with_mfa(mfa),
        ))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers)
    }
}

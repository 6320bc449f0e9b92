use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use super::jwt::Claims;
use super::rbac::{self, Table, TableAction};
use crate::error::{ApiResult, AppError};
use crate::AppState;

/// Authenticated caller, built from a verified bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role_ids: Vec<Uuid>,
    pub role_names: Vec<String>,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            role_ids: claims.roles,
            role_names: claims.role_names,
        }
    }
}

impl AuthUser {
    /// Checks a table permission against the state's permission set.
    pub fn require(&self, state: &AppState, table: Table, action: TableAction) -> ApiResult<()> {
        rbac::require(state.table_permissions.as_ref(), self, table, action)
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Extract Bearer token from Authorization header
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthenticated("Missing authorization header".to_string()).into_response()
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Unauthenticated("Invalid authorization format".to_string()).into_response()
        })?;

        let token_data = state
            .jwt
            .verify(token)
            .map_err(|e| AppError::from(e).into_response())?;

        Ok(token_data.claims.into())
    }
}

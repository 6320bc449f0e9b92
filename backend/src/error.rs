//! Standardized error handling for the workflow API
//!
//! Every synchronous endpoint answers failures with the same body shape:
//! a machine-readable `code`, a human-readable `message`, and optional
//! field-level `details`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::workflows::actions::ActionError;
use crate::workflows::engine::EngineError;
use crate::workflows::queue::QueueError;
use crate::workflows::store::StoreError;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "INVALID_ARGUMENT", "NOT_FOUND", "PERMISSION_DENIED")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    /// Malformed input, bad DAG shape, malformed JSON config
    InvalidArgument {
        message: String,
        details: Option<HashMap<String, Vec<String>>>,
    },
    /// Missing or invalid token
    Unauthenticated(String),
    /// Authenticated but not permitted; also used for unknown action types
    PermissionDenied(String),
    NotFound(String),
    /// Referential-integrity violations
    Aborted(String),
    Internal(String),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create a validation error with a single field error
    pub fn validation_single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert(field.into(), vec![message.into()]);
        Self::InvalidArgument {
            message: "Validation failed".to_string(),
            details: Some(details),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Aborted(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Aborted(_) => "ABORTED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::InvalidArgument { message, .. } => message.clone(),
            Self::Unauthenticated(msg) => msg.clone(),
            Self::PermissionDenied(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::Aborted(msg) => msg.clone(),
            Self::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::InvalidArgument { details, .. } = &self {
            error.details = details.clone();
        }

        (status, Json(error)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvalidShape(msg) | StoreError::InvalidArgument(msg) => Self::invalid(msg),
            StoreError::WrongRule(msg) | StoreError::Conflict(msg) => Self::Aborted(msg),
            StoreError::Database(msg) => Self::Internal(msg),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(e) => e.into(),
            EngineError::Timeout(after) => Self::Aborted(format!("timed out after {}s", after.as_secs())),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Store(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ActionError> for AppError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::InvalidConfig(msg) => Self::validation_single("action_config", msg),
            // unknown types look exactly like unpermitted ones
            ActionError::NotRegistered(_) => Self::PermissionDenied(ACTION_DENIED.to_string()),
            ActionError::Failed(msg) | ActionError::Unavailable(msg) => Self::Internal(msg),
        }
    }
}

/// Message shared by every action-type authorization failure.
pub const ACTION_DENIED: &str = "Not permitted to execute this action type";

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                Self::Unauthenticated("Authentication token has expired".to_string())
            }
            _ => Self::Unauthenticated(format!("Invalid token: {}", err)),
        }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper to add multiple validation errors
pub struct ValidationBuilder {
    details: HashMap<String, Vec<String>>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self {
            details: HashMap::new(),
        }
    }

    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.push(field, message);
        self
    }

    pub fn push(&mut self, field: &str, message: &str) {
        self.details
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }

    pub fn build(self) -> Option<AppError> {
        if self.details.is_empty() {
            None
        } else {
            Some(AppError::InvalidArgument {
                message: "Validation failed".to_string(),
                details: Some(self.details),
            })
        }
    }

    /// Ok when nothing was recorded, otherwise the collected validation error.
    pub fn finish(self) -> ApiResult<()> {
        match self.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.details.is_empty()
    }
}

impl Default for ValidationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

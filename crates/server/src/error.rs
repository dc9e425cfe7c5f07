use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::cache::CacheError;

/// A single offending input field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    pub name: String,
    pub description: String,
}

impl FieldError {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Every failure an engine operation can report.
#[derive(Debug, Error)]
pub enum SsoError {
    #[error("Invalid user input: {description}")]
    InvalidUserInput {
        description: String,
        fields: Vec<FieldError>,
    },
    #[error("No record found: {0}")]
    NoRecordFound(String),
    #[error("Data already exists: {0}")]
    DataExists(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),
    #[error("Unauthorized client: {0}")]
    UnauthorizedClient(String),
    #[error("Deadline exceeded while waiting for {0}")]
    Unavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SsoError {
    /// Input error blaming a single field.
    pub fn invalid_field(field: &str, description: impl Into<String>) -> Self {
        let description = description.into();
        SsoError::InvalidUserInput {
            fields: vec![FieldError::new(field, description.clone())],
            description,
        }
    }

    pub fn invalid_input(description: impl Into<String>) -> Self {
        SsoError::InvalidUserInput {
            description: description.into(),
            fields: Vec::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SsoError::InvalidUserInput { .. }
            | SsoError::DataExists(_)
            | SsoError::InvalidGrant(_)
            | SsoError::UnauthorizedClient(_) => StatusCode::BAD_REQUEST,
            SsoError::NoRecordFound(_) => StatusCode::NOT_FOUND,
            SsoError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SsoError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SsoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable message, also used as the OAuth2 `error` parameter.
    pub fn message(&self) -> &'static str {
        match self {
            SsoError::InvalidUserInput { .. } => "invalid_request",
            SsoError::NoRecordFound(_) => "not_found",
            SsoError::DataExists(_) => "data_exists",
            SsoError::Unauthorized(_) => "unauthorized",
            SsoError::InvalidGrant(_) => "invalid_grant",
            SsoError::UnauthorizedClient(_) => "unauthorized_client",
            SsoError::Unavailable(_) => "temporarily_unavailable",
            SsoError::Internal(_) => "server_error",
        }
    }

    /// Description that is safe to hand to a client.
    pub fn public_description(&self) -> String {
        match self {
            SsoError::InvalidUserInput { description, .. } => description.clone(),
            SsoError::NoRecordFound(d)
            | SsoError::DataExists(d)
            | SsoError::Unauthorized(d)
            | SsoError::InvalidGrant(d)
            | SsoError::UnauthorizedClient(d) => d.clone(),
            SsoError::Unavailable(_) => "The service is temporarily unavailable".to_string(),
            SsoError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SsoError::Unavailable(_))
    }

    pub fn to_response_body(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.status().as_u16(),
            message: self.message().to_string(),
            description: self.public_description(),
            field_error: match self {
                SsoError::InvalidUserInput { fields, .. } => fields.clone(),
                _ => Vec::new(),
            },
        }
    }
}

impl From<sea_orm::DbErr> for SsoError {
    fn from(e: sea_orm::DbErr) -> Self {
        tracing::error!(error = %e, "database error");
        SsoError::Internal(format!("database: {e}"))
    }
}

impl From<sea_orm::TransactionError<SsoError>> for SsoError {
    fn from(e: sea_orm::TransactionError<SsoError>) -> Self {
        match e {
            sea_orm::TransactionError::Connection(db) => db.into(),
            sea_orm::TransactionError::Transaction(inner) => inner,
        }
    }
}

impl From<CacheError> for SsoError {
    fn from(e: CacheError) -> Self {
        tracing::error!(error = %e, "cache error");
        SsoError::Internal(format!("cache: {e}"))
    }
}

impl From<reqwest::Error> for SsoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            tracing::warn!(error = %e, "outbound request timed out");
            return SsoError::Unavailable("outbound http".into());
        }
        tracing::error!(error = %e, "outbound request failed");
        SsoError::Internal(format!("http: {e}"))
    }
}

/// JSON body returned by every API endpoint on failure.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    pub description: String,
    #[serde(default)]
    pub field_error: Vec<FieldError>,
}

impl IntoResponse for SsoError {
    fn into_response(self) -> Response {
        if let SsoError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "request failed with internal error");
        }
        (self.status(), Json(self.to_response_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_is_not_exposed() {
        let err = SsoError::Internal("connection refused on 10.0.0.3".into());
        let body = err.to_response_body();
        assert_eq!(body.code, 500);
        assert_eq!(body.message, "server_error");
        assert!(!body.description.contains("10.0.0.3"));
    }

    #[test]
    fn invalid_field_carries_field_error() {
        let err = SsoError::invalid_field("redirect_uri", "redirect_uri is not a valid URL");
        let body = err.to_response_body();
        assert_eq!(body.code, 400);
        assert_eq!(body.field_error.len(), 1);
        assert_eq!(body.field_error[0].name, "redirect_uri");
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            SsoError::NoRecordFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SsoError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SsoError::InvalidGrant("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SsoError::Unavailable("cache".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert!(SsoError::Unavailable("cache".into()).is_retryable());
        assert!(!SsoError::Internal("x".into()).is_retryable());
    }
}

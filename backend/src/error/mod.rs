use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::FamilyId;
use crate::utils::jwt::TokenError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Persistence failures. Never security decisions on their own.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("store unavailable")]
    Unavailable,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable
            }
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is disabled")]
    AccountDisabled,
    #[error("Account is suspended")]
    AccountSuspended,
    #[error("Session not found")]
    NotFound,
    #[error("Session belongs to another account")]
    Forbidden,
    #[error("Refresh token has been revoked")]
    Revoked,
    #[error("Refresh token has expired")]
    Expired,
    #[error("Refresh token reuse detected for family {family_id}")]
    TokenReuseDetected { family_id: FamilyId },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Account is locked, try again in {remaining_minutes} minutes")]
    AccountLocked {
        locked_until: DateTime<Utc>,
        remaining_minutes: i64,
    },
    #[error("Too many login attempts, try again in {retry_after_minutes} minutes")]
    TooManyRequests { retry_after_minutes: i64 },
    #[error("Maximum of {max} concurrent sessions reached")]
    SessionLimitExceeded { max: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::AccountDisabled => "ACCOUNT_DISABLED",
            AuthError::AccountSuspended => "ACCOUNT_SUSPENDED",
            AuthError::NotFound => "NOT_FOUND",
            AuthError::Forbidden => "FORBIDDEN",
            AuthError::Revoked => "TOKEN_REVOKED",
            AuthError::Expired => "TOKEN_EXPIRED",
            AuthError::TokenReuseDetected { .. } => "TOKEN_REUSE_DETECTED",
            AuthError::Token(TokenError::KeyTooShort { .. } | TokenError::Signing(_)) => {
                "INTERNAL_SERVER_ERROR"
            }
            AuthError::Token(TokenError::WrongTokenType { .. }) => "WRONG_TOKEN_TYPE",
            AuthError::Token(_) => "JWT_ERROR",
            AuthError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AuthError::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            AuthError::SessionLimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
            AuthError::Store(StoreError::Unavailable | StoreError::Database(_)) => {
                "SERVICE_UNAVAILABLE"
            }
            AuthError::Store(StoreError::Corrupt(_)) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials
            | AuthError::Revoked
            | AuthError::Expired
            | AuthError::TokenReuseDetected { .. } => StatusCode::UNAUTHORIZED,
            AuthError::AccountDisabled | AuthError::AccountSuspended | AuthError::Forbidden => {
                StatusCode::FORBIDDEN
            }
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::Token(TokenError::KeyTooShort { .. } | TokenError::Signing(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AuthError::Token(_) => StatusCode::UNAUTHORIZED,
            AuthError::AccountLocked { .. } => StatusCode::LOCKED,
            AuthError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::SessionLimitExceeded { .. } => StatusCode::CONFLICT,
            AuthError::Store(StoreError::Corrupt(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AuthError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// True only for infrastructure failures the client may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Store(StoreError::Unavailable | StoreError::Database(_))
        )
    }

    /// Retry hint in seconds for rate and lockout errors.
    pub fn retry_after_seconds(&self) -> Option<i64> {
        match self {
            AuthError::AccountLocked {
                remaining_minutes, ..
            } => Some(remaining_minutes * 60),
            AuthError::TooManyRequests {
                retry_after_minutes,
            } => Some(retry_after_minutes * 60),
            _ => None,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AuthError::TokenReuseDetected { family_id } => {
                Some(serde_json::json!({ "family_id": family_id }))
            }
            AuthError::AccountLocked {
                locked_until,
                remaining_minutes,
            } => Some(serde_json::json!({
                "locked_until": locked_until,
                "remaining_minutes": remaining_minutes,
            })),
            AuthError::TooManyRequests {
                retry_after_minutes,
            } => Some(serde_json::json!({ "retry_after_minutes": retry_after_minutes })),
            AuthError::SessionLimitExceeded { max } => {
                Some(serde_json::json!({ "max_sessions": max }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = ?self, "Internal auth failure");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let retry_after = self.retry_after_seconds();
        let body = Json(ErrorResponse {
            error: message,
            code: self.code().to_string(),
            details: self.details(),
        });

        let mut response = (status, body).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

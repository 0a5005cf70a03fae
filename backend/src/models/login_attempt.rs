//! Login attempt ledger entries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::account::AccountType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a login attempt was rejected by the credential check.
pub enum FailureReason {
    UnknownAccount,
    InvalidCredentials,
    AccountDisabled,
    AccountSuspended,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownAccount => "User not found",
            FailureReason::InvalidCredentials => "Invalid credentials",
            FailureReason::AccountDisabled => "Account deactivated",
            FailureReason::AccountSuspended => "Account suspended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Persisted, append-only login attempt.
pub struct LoginAttempt {
    pub id: i64,
    pub identifier: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub successful: bool,
    pub failure_reason: Option<String>,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLoginAttempt {
    /// Always lower-cased.
    pub identifier: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub successful: bool,
    pub failure_reason: Option<String>,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
}

impl NewLoginAttempt {
    pub fn success(
        identifier: &str,
        ip_address: &str,
        user_agent: Option<&str>,
        account_type: AccountType,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: normalize_identifier(identifier),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.map(str::to_string),
            successful: true,
            failure_reason: None,
            account_type,
            created_at: at,
        }
    }

    pub fn failure(
        identifier: &str,
        ip_address: &str,
        user_agent: Option<&str>,
        account_type: AccountType,
        reason: FailureReason,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            successful: false,
            failure_reason: Some(reason.as_str().to_string()),
            ..Self::success(identifier, ip_address, user_agent, account_type, at)
        }
    }

    pub(crate) fn into_attempt(self, id: i64) -> LoginAttempt {
        LoginAttempt {
            id,
            identifier: self.identifier,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            successful: self.successful,
            failure_reason: self.failure_reason,
            account_type: self.account_type,
            created_at: self.created_at,
        }
    }
}

/// Login handles are case-insensitive; the ledger keys on the lower-cased form.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_attempt_lowercases_identifier_and_keeps_reason() {
        let attempt = NewLoginAttempt::failure(
            " Alice@Example.com",
            "1.2.3.4",
            Some("ua"),
            AccountType::User,
            FailureReason::InvalidCredentials,
            Utc::now(),
        );
        assert_eq!(attempt.identifier, "alice@example.com");
        assert!(!attempt.successful);
        assert_eq!(attempt.failure_reason.as_deref(), Some("Invalid credentials"));
    }

    #[test]
    fn success_attempt_has_no_reason() {
        let attempt =
            NewLoginAttempt::success("Bob", "::1", None, AccountType::Moderator, Utc::now());
        assert!(attempt.successful);
        assert_eq!(attempt.failure_reason, None);
        assert_eq!(attempt.account_type, AccountType::Moderator);
    }
}

//! Boundary to the account store that owns passwords and account status.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AuthError, StoreError};
use crate::models::account::{AccountType, AuthenticatedAccount};
use crate::models::login_attempt::FailureReason;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("account not found")]
    UnknownAccount,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account disabled")]
    AccountDisabled,
    #[error("account suspended")]
    AccountSuspended,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CredentialError {
    /// Reason written to the attempt ledger; `None` for infrastructure failures,
    /// which say nothing about the caller.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            CredentialError::UnknownAccount => Some(FailureReason::UnknownAccount),
            CredentialError::InvalidCredentials => Some(FailureReason::InvalidCredentials),
            CredentialError::AccountDisabled => Some(FailureReason::AccountDisabled),
            CredentialError::AccountSuspended => Some(FailureReason::AccountSuspended),
            CredentialError::Store(_) => None,
        }
    }
}

impl From<CredentialError> for AuthError {
    fn from(err: CredentialError) -> Self {
        match err {
            // Unknown accounts are indistinguishable from bad passwords to the caller.
            CredentialError::UnknownAccount | CredentialError::InvalidCredentials => {
                AuthError::InvalidCredentials
            }
            CredentialError::AccountDisabled => AuthError::AccountDisabled,
            CredentialError::AccountSuspended => AuthError::AccountSuspended,
            CredentialError::Store(err) => AuthError::Store(err),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Checks the password and account status for the given login handle.
    async fn verify(
        &self,
        identifier: &str,
        password: &str,
        account_type: AccountType,
    ) -> Result<AuthenticatedAccount, CredentialError>;

    /// Current view of an account, used to mint access tokens on refresh.
    async fn find_account(
        &self,
        account_type: AccountType,
        uuid: Uuid,
    ) -> Result<Option<AuthenticatedAccount>, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_account_surfaces_as_invalid_credentials() {
        assert!(matches!(
            AuthError::from(CredentialError::UnknownAccount),
            AuthError::InvalidCredentials
        ));
        assert_eq!(
            CredentialError::UnknownAccount.failure_reason(),
            Some(FailureReason::UnknownAccount)
        );
    }

    #[test]
    fn store_failures_have_no_failure_reason() {
        let err = CredentialError::Store(StoreError::Unavailable);
        assert_eq!(err.failure_reason(), None);
        assert!(AuthError::from(err).is_retryable());
    }

    #[test]
    fn mock_credential_verifier_is_send_sync() {
        fn check_send_sync<T: Send + Sync>() {}
        check_send_sync::<MockCredentialVerifier>();
    }
}

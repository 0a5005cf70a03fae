//! Login, refresh and session management for users and moderators.

use serde::Serialize;
use std::sync::Arc;

use crate::error::AuthError;
use crate::models::account::{AccountRef, AccountStatus, AccountType, AuthenticatedAccount};
use crate::models::session::{SessionInfo, SessionRecord, SessionSummary};
use crate::services::credentials::{CredentialError, CredentialVerifier};
use crate::services::login_guard::LoginGuard;
use crate::services::session::SessionEngine;
use crate::types::FamilyId;

pub const TOKEN_TYPE_BEARER: &str = "Bearer";

#[derive(Debug, Clone, Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// Session family and generation, kept out of the response body for
    /// callers that mark "this device" in session listings.
    #[serde(skip_serializing)]
    pub family_id: FamilyId,
    #[serde(skip_serializing)]
    pub generation: i32,
}

pub struct AuthService {
    verifier: Arc<dyn CredentialVerifier>,
    guard: Arc<LoginGuard>,
    sessions: Arc<SessionEngine>,
}

impl AuthService {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        guard: Arc<LoginGuard>,
        sessions: Arc<SessionEngine>,
    ) -> Self {
        Self {
            verifier,
            guard,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionEngine {
        &self.sessions
    }

    pub fn guard(&self) -> &LoginGuard {
        &self.guard
    }

    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        account_type: AccountType,
        remember_me: bool,
        info: &SessionInfo,
    ) -> Result<AuthTokens, AuthError> {
        self.guard
            .check_login_allowed(identifier, &info.ip_address)
            .await?;

        let account = match self
            .verifier
            .verify(identifier, password, account_type)
            .await
            .and_then(ensure_active)
        {
            Ok(account) => account,
            Err(err) => {
                if let Some(reason) = err.failure_reason() {
                    self.guard
                        .record_failure(identifier, info, account_type, reason)
                        .await?;
                }
                return Err(err.into());
            }
        };

        self.guard
            .record_success(identifier, info, account_type)
            .await?;
        let record = self
            .sessions
            .create_session(&account, info, remember_me)
            .await?;
        let tokens = self.issue_tokens(&account, &record)?;

        tracing::info!(
            account = %account.account,
            family_id = %record.family_id,
            ip = %info.ip_address,
            remember_me,
            "Login succeeded"
        );
        Ok(tokens)
    }

    /// Rotates a refresh token. Reuse of a rotated token is detected before
    /// the token's expiry or the account's status is looked at.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        info: &SessionInfo,
    ) -> Result<AuthTokens, AuthError> {
        let (record, claims) = self
            .sessions
            .validate_refresh(refresh_token.trim())
            .await?;
        let account = self
            .verifier
            .find_account(claims.account_type, claims.uuid)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let account = ensure_active(account)?;

        if record.account != account.account {
            tracing::warn!(
                family_id = %record.family_id,
                token_account = %record.account,
                resolved_account = %account.account,
                "Refresh token resolved to a different account"
            );
            self.sessions.revoke_session(record.family_id).await?;
            return Err(AuthError::Forbidden);
        }

        let next = self
            .sessions
            .rotate_validated(&record, &claims, info)
            .await?;
        self.issue_tokens(&account, &next)
    }

    pub async fn logout(&self, family_id: FamilyId) -> Result<(), AuthError> {
        self.sessions.revoke_session(family_id).await?;
        Ok(())
    }

    pub async fn logout_all(&self, account: AccountRef) -> Result<u64, AuthError> {
        self.sessions.revoke_all_sessions(account).await
    }

    pub async fn list_sessions(
        &self,
        account: AccountRef,
        current_family: Option<FamilyId>,
    ) -> Result<Vec<SessionSummary>, AuthError> {
        let live = self.sessions.get_active_sessions(account).await?;
        Ok(live
            .iter()
            .map(|record| SessionSummary::from_record(record, current_family))
            .collect())
    }

    /// Revokes one of the caller's own sessions.
    pub async fn revoke_session(
        &self,
        account: AccountRef,
        family_id: FamilyId,
    ) -> Result<(), AuthError> {
        let history = self.sessions.family_history(family_id).await?;
        let owner = history
            .first()
            .map(|record| record.account)
            .ok_or(AuthError::NotFound)?;
        if owner != account {
            tracing::warn!(
                account = %account,
                owner = %owner,
                family_id = %family_id,
                "Attempt to revoke a session owned by another account"
            );
            return Err(AuthError::Forbidden);
        }
        self.sessions.revoke_session(family_id).await?;
        Ok(())
    }

    /// Signs out every other device, e.g. after a password change.
    pub async fn revoke_other_sessions(
        &self,
        account: AccountRef,
        keep_family: FamilyId,
    ) -> Result<u64, AuthError> {
        self.sessions.revoke_other_sessions(account, keep_family).await
    }

    pub async fn active_session_count(&self, account: AccountRef) -> Result<u64, AuthError> {
        self.sessions.active_session_count(account).await
    }

    pub async fn remaining_attempts(&self, identifier: &str) -> Result<u32, AuthError> {
        self.guard.remaining_attempts(identifier).await
    }

    fn issue_tokens(
        &self,
        account: &AuthenticatedAccount,
        record: &SessionRecord,
    ) -> Result<AuthTokens, AuthError> {
        let codec = self.sessions.codec();
        let access_token = codec.issue_access(
            account.uuid,
            account.account_type(),
            &account.username,
            &account.roles,
            record.family_id,
        )?;
        Ok(AuthTokens {
            access_token,
            refresh_token: record.token.clone(),
            token_type: TOKEN_TYPE_BEARER,
            expires_in: codec.access_ttl().num_seconds(),
            family_id: record.family_id,
            generation: record.generation,
        })
    }
}

fn ensure_active(account: AuthenticatedAccount) -> Result<AuthenticatedAccount, CredentialError> {
    match account.status {
        AccountStatus::Active => Ok(account),
        AccountStatus::Disabled => Err(CredentialError::AccountDisabled),
        AccountStatus::Suspended => Err(CredentialError::AccountSuspended),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitConfig, SessionConfig, TokenConfig};
    use crate::repositories::memory::{MemoryAttemptLedger, MemorySessionStore};
    use crate::services::credentials::MockCredentialVerifier;
    use crate::types::UserId;
    use crate::utils::jwt::{TokenCodec, TokenType};
    use crate::utils::time::ManualClock;
    use mockall::predicate::eq;
    use uuid::Uuid;

    fn alice() -> AuthenticatedAccount {
        AuthenticatedAccount {
            account: AccountRef::User(UserId::new(1)),
            uuid: Uuid::new_v4(),
            username: "alice".into(),
            roles: vec!["ROLE_USER".into()],
            status: AccountStatus::Active,
        }
    }

    fn service(verifier: MockCredentialVerifier) -> (AuthService, Arc<MemoryAttemptLedger>) {
        let clock = Arc::new(ManualClock::default());
        let codec = Arc::new(
            TokenCodec::new(
                &TokenConfig {
                    secret: "auth-service-test-secret-32-bytes!!".into(),
                    issuer: "identity-test".into(),
                    access_ttl_seconds: 900,
                    refresh_ttl_seconds: 7 * 24 * 3600,
                },
                clock.clone(),
            )
            .expect("codec"),
        );
        let ledger = Arc::new(MemoryAttemptLedger::new());
        let guard = Arc::new(LoginGuard::new(
            ledger.clone(),
            clock.clone(),
            RateLimitConfig::default(),
        ));
        let sessions = Arc::new(SessionEngine::new(
            Arc::new(MemorySessionStore::new()),
            codec,
            clock,
            SessionConfig::default(),
        ));
        (AuthService::new(Arc::new(verifier), guard, sessions), ledger)
    }

    fn device() -> SessionInfo {
        SessionInfo::new("192.0.2.10", Some("curl/8.0"))
    }

    #[tokio::test]
    async fn login_issues_bearer_tokens_and_records_success() {
        let account = alice();
        let mut verifier = MockCredentialVerifier::new();
        let returned = account.clone();
        verifier
            .expect_verify()
            .with(eq("alice"), eq("s3cret"), eq(AccountType::User))
            .times(1)
            .returning(move |_, _, _| Ok(returned.clone()));
        let (service, ledger) = service(verifier);

        let tokens = service
            .login("alice", "s3cret", AccountType::User, false, &device())
            .await
            .unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, 900);
        assert_eq!(tokens.generation, 1);

        let codec = service.sessions().codec();
        let access = codec.require_access(&tokens.access_token).unwrap();
        assert_eq!(access.uuid, account.uuid);
        assert_eq!(access.roles, Some(vec!["ROLE_USER".to_string()]));
        assert_eq!(access.family_id, tokens.family_id);
        let refresh = codec.require_refresh(&tokens.refresh_token).unwrap();
        assert_eq!(refresh.token_type, TokenType::Refresh);

        let attempts = ledger.snapshot().await;
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].successful);
    }

    #[tokio::test]
    async fn failed_login_is_recorded_with_reason() {
        let mut verifier = MockCredentialVerifier::new();
        verifier
            .expect_verify()
            .returning(|_, _, _| Err(CredentialError::UnknownAccount));
        let (service, ledger) = service(verifier);

        let err = service
            .login("Ghost", "pw", AccountType::User, false, &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        let attempts = ledger.snapshot().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].identifier, "ghost");
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("User not found"));
        assert_eq!(service.remaining_attempts("ghost").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn locked_identity_skips_credential_check() {
        let mut verifier = MockCredentialVerifier::new();
        verifier
            .expect_verify()
            .times(5)
            .returning(|_, _, _| Err(CredentialError::InvalidCredentials));
        let (service, ledger) = service(verifier);

        for _ in 0..5 {
            let _ = service
                .login("alice", "wrong", AccountType::User, false, &device())
                .await;
        }
        let err = service
            .login("alice", "right", AccountType::User, false, &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked { remaining_minutes: 15, .. }));
        assert_eq!(ledger.snapshot().await.len(), 5);
    }

    #[tokio::test]
    async fn disabled_accounts_cannot_log_in() {
        let mut verifier = MockCredentialVerifier::new();
        verifier.expect_verify().returning(|_, _, _| {
            Ok(AuthenticatedAccount {
                status: AccountStatus::Disabled,
                ..alice()
            })
        });
        let (service, ledger) = service(verifier);

        let err = service
            .login("alice", "pw", AccountType::User, false, &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountDisabled));
        assert_eq!(
            ledger.snapshot().await[0].failure_reason.as_deref(),
            Some("Account deactivated")
        );
    }

    #[tokio::test]
    async fn store_failures_from_verifier_are_not_counted_as_strikes() {
        let mut verifier = MockCredentialVerifier::new();
        verifier
            .expect_verify()
            .returning(|_, _, _| Err(CredentialError::Store(crate::error::StoreError::Unavailable)));
        let (service, ledger) = service(verifier);

        let err = service
            .login("alice", "pw", AccountType::User, false, &device())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(ledger.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn refresh_rotates_and_reissues_access_token() {
        let account = alice();
        let mut verifier = MockCredentialVerifier::new();
        let for_verify = account.clone();
        verifier
            .expect_verify()
            .returning(move |_, _, _| Ok(for_verify.clone()));
        let for_lookup = account.clone();
        verifier
            .expect_find_account()
            .with(eq(AccountType::User), eq(account.uuid))
            .returning(move |_, _| Ok(Some(for_lookup.clone())));
        let (service, _) = service(verifier);

        let first = service
            .login("alice", "pw", AccountType::User, false, &device())
            .await
            .unwrap();
        let second = service.refresh(&first.refresh_token, &device()).await.unwrap();
        assert_eq!(second.family_id, first.family_id);
        assert_eq!(second.generation, 2);
        assert_ne!(second.refresh_token, first.refresh_token);

        let err = service
            .refresh(&first.refresh_token, &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenReuseDetected { .. }));
        assert!(service
            .list_sessions(account.account, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn refresh_rejects_access_tokens_and_disabled_accounts() {
        let account = alice();
        let mut verifier = MockCredentialVerifier::new();
        let for_verify = account.clone();
        verifier
            .expect_verify()
            .returning(move |_, _, _| Ok(for_verify.clone()));
        let disabled = AuthenticatedAccount {
            status: AccountStatus::Disabled,
            ..account.clone()
        };
        verifier
            .expect_find_account()
            .returning(move |_, _| Ok(Some(disabled.clone())));
        let (service, _) = service(verifier);

        let tokens = service
            .login("alice", "pw", AccountType::User, false, &device())
            .await
            .unwrap();
        assert!(matches!(
            service.refresh(&tokens.access_token, &device()).await,
            Err(AuthError::NotFound)
        ));
        assert!(matches!(
            service.refresh(&tokens.refresh_token, &device()).await,
            Err(AuthError::AccountDisabled)
        ));
    }

    #[tokio::test]
    async fn replayed_token_is_reuse_without_an_account_lookup() {
        let account = alice();
        let mut verifier = MockCredentialVerifier::new();
        let for_verify = account.clone();
        verifier
            .expect_verify()
            .returning(move |_, _, _| Ok(for_verify.clone()));
        let for_lookup = account.clone();
        verifier
            .expect_find_account()
            .times(1)
            .returning(move |_, _| Ok(Some(for_lookup.clone())));
        let (service, _) = service(verifier);

        let first = service
            .login("alice", "pw", AccountType::User, false, &device())
            .await
            .unwrap();
        service.refresh(&first.refresh_token, &device()).await.unwrap();

        // The replay never reaches the account lookup.
        let err = service
            .refresh(&first.refresh_token, &device())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenReuseDetected { family_id } if family_id == first.family_id));
        let history = service.sessions().family_history(first.family_id).await.unwrap();
        assert!(history.iter().all(|r| r.revoked));
    }

    #[tokio::test]
    async fn revoke_session_checks_ownership() {
        let account = alice();
        let mut verifier = MockCredentialVerifier::new();
        let for_verify = account.clone();
        verifier
            .expect_verify()
            .returning(move |_, _, _| Ok(for_verify.clone()));
        let (service, _) = service(verifier);

        let tokens = service
            .login("alice", "pw", AccountType::User, false, &device())
            .await
            .unwrap();
        let intruder = AccountRef::User(UserId::new(99));

        assert!(matches!(
            service.revoke_session(intruder, tokens.family_id).await,
            Err(AuthError::Forbidden)
        ));
        assert!(matches!(
            service.revoke_session(account.account, FamilyId::new()).await,
            Err(AuthError::NotFound)
        ));
        assert_eq!(service.active_session_count(account.account).await.unwrap(), 1);

        service
            .revoke_session(account.account, tokens.family_id)
            .await
            .unwrap();
        assert_eq!(service.active_session_count(account.account).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_sessions_marks_current_device() {
        let account = alice();
        let mut verifier = MockCredentialVerifier::new();
        let for_verify = account.clone();
        verifier
            .expect_verify()
            .returning(move |_, _, _| Ok(for_verify.clone()));
        let (service, _) = service(verifier);

        let here = service
            .login("alice", "pw", AccountType::User, true, &device())
            .await
            .unwrap();
        service
            .login("alice", "pw", AccountType::User, true, &SessionInfo::new("198.51.100.7", None))
            .await
            .unwrap();

        let sessions = service
            .list_sessions(account.account, Some(here.family_id))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        let current: Vec<_> = sessions.iter().filter(|s| s.is_current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].family_id, here.family_id);
        assert_eq!(current[0].user_agent.as_deref(), Some("curl/8.0"));

        assert_eq!(
            service
                .revoke_other_sessions(account.account, here.family_id)
                .await
                .unwrap(),
            1
        );
        service.logout(here.family_id).await.unwrap();
        assert_eq!(service.logout_all(account.account).await.unwrap(), 0);
    }
}

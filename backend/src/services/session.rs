//! Session lifecycle: creation under the per-account cap, rotation with
//! reuse detection, and revocation.

use chrono::Duration;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::models::account::{AccountRef, AccountType, AuthenticatedAccount};
use crate::models::session::{NewSession, SessionInfo, SessionRecord};
use crate::repositories::session::{
    CreateOutcome, LimitOutcome, RotationOutcome, SessionLimit, SessionStore,
};
use crate::types::FamilyId;
use crate::utils::jwt::{Claims, TokenCodec};
use crate::utils::time::Clock;

pub struct SessionEngine {
    store: Arc<dyn SessionStore>,
    codec: Arc<TokenCodec>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        codec: Arc<TokenCodec>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            codec,
            clock,
            config,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    fn limit_for(&self, account_type: AccountType) -> SessionLimit {
        SessionLimit {
            max: self.config.max_sessions(account_type),
            policy: self.config.limit_policy,
        }
    }

    /// Moderators always get the long lifetime; users only with remember-me.
    fn lifetime_for(&self, account_type: AccountType, remember_me: bool) -> Duration {
        if remember_me || account_type == AccountType::Moderator {
            self.codec.refresh_ttl()
        } else {
            self.config.default_ttl()
        }
    }

    pub async fn create_session(
        &self,
        account: &AuthenticatedAccount,
        info: &SessionInfo,
        remember_me: bool,
    ) -> Result<SessionRecord, AuthError> {
        let now = self.clock.now();
        let account_type = account.account_type();
        let lifetime = self.lifetime_for(account_type, remember_me);
        let family_id = FamilyId::new();
        let token = self.codec.issue_refresh_with_ttl(
            account.uuid,
            account_type,
            &account.username,
            family_id,
            1,
            lifetime,
        )?;

        let session = NewSession {
            token,
            family_id,
            generation: 1,
            account: account.account,
            ip_address: info.ip_address.clone(),
            user_agent: info.user_agent.clone(),
            created_at: now,
            expires_at: now + lifetime,
        };
        let limit = self.limit_for(account_type);

        match self.store.create(session, limit, now).await? {
            CreateOutcome::Created { record, evicted } => {
                for family in &evicted {
                    tracing::info!(
                        account = %account.account,
                        family_id = %family,
                        max_sessions = limit.max,
                        "Evicted oldest session to stay under the session cap"
                    );
                }
                tracing::info!(
                    account = %account.account,
                    family_id = %record.family_id,
                    ip = %record.ip_address,
                    expires_at = %record.expires_at,
                    "Session created"
                );
                Ok(record)
            }
            CreateOutcome::LimitReached => {
                tracing::warn!(
                    account = %account.account,
                    max_sessions = limit.max,
                    "Session refused: concurrent session limit reached"
                );
                Err(AuthError::SessionLimitExceeded { max: limit.max })
            }
        }
    }

    /// Makes room for one more session, returning the evicted families.
    pub async fn enforce_session_limit(
        &self,
        account: AccountRef,
    ) -> Result<Vec<FamilyId>, AuthError> {
        let limit = self.limit_for(account.account_type());
        match self.store.enforce_limit(account, limit, self.clock.now()).await? {
            LimitOutcome::Within => Ok(Vec::new()),
            LimitOutcome::Evicted(families) => {
                for family in &families {
                    tracing::info!(
                        account = %account,
                        family_id = %family,
                        max_sessions = limit.max,
                        "Evicted oldest session to stay under the session cap"
                    );
                }
                Ok(families)
            }
            LimitOutcome::Exceeded => Err(AuthError::SessionLimitExceeded { max: limit.max }),
        }
    }

    /// Exchanges a live refresh token for its successor.
    ///
    /// Presenting a token that was already rotated revokes its whole family.
    pub async fn rotate_token(
        &self,
        token: &str,
        info: &SessionInfo,
    ) -> Result<SessionRecord, AuthError> {
        let (record, claims) = self.validate_refresh(token).await?;
        self.rotate_validated(&record, &claims, info).await
    }

    /// Resolves a presented refresh token to its live record.
    ///
    /// Checks run in a fixed order: unknown, revoked, already used, expired,
    /// then the signature. A used token is always treated as reuse and kills
    /// the family, whatever state its JWT or account is in.
    pub async fn validate_refresh(
        &self,
        token: &str,
    ) -> Result<(SessionRecord, Claims), AuthError> {
        let record = self
            .store
            .find_by_token(token)
            .await?
            .ok_or(AuthError::NotFound)?;

        if record.revoked {
            return Err(AuthError::Revoked);
        }
        if record.used {
            return Err(self.handle_reuse(&record).await);
        }
        if record.is_expired(self.clock.now()) {
            return Err(AuthError::Expired);
        }

        let claims = self.codec.require_refresh(&record.token)?;
        Ok((record, claims))
    }

    /// Rotates a record returned by [`Self::validate_refresh`].
    pub async fn rotate_validated(
        &self,
        record: &SessionRecord,
        claims: &Claims,
        info: &SessionInfo,
    ) -> Result<SessionRecord, AuthError> {
        let now = self.clock.now();
        let generation = record.generation + 1;
        let lifetime = record.lifetime();
        let successor_token = self.codec.issue_refresh_with_ttl(
            claims.uuid,
            record.account_type(),
            &claims.sub,
            record.family_id,
            generation,
            lifetime,
        )?;
        let successor = NewSession {
            token: successor_token,
            family_id: record.family_id,
            generation,
            account: record.account,
            ip_address: info.ip_address.clone(),
            user_agent: info.user_agent.clone(),
            created_at: now,
            expires_at: now + lifetime,
        };

        match self.store.rotate(record.id, now, successor).await? {
            RotationOutcome::Rotated(next) => {
                tracing::debug!(
                    family_id = %next.family_id,
                    generation = next.generation,
                    "Refresh token rotated"
                );
                Ok(next)
            }
            RotationOutcome::Conflict => {
                // Lost a race with another rotation or a revocation.
                let current = self
                    .store
                    .find_by_token(&record.token)
                    .await?
                    .ok_or(AuthError::NotFound)?;
                if current.revoked {
                    Err(AuthError::Revoked)
                } else {
                    Err(self.handle_reuse(&current).await)
                }
            }
        }
    }

    async fn handle_reuse(&self, record: &SessionRecord) -> AuthError {
        match self.store.revoke_family(record.family_id).await {
            Ok(revoked) => {
                tracing::warn!(
                    family_id = %record.family_id,
                    account = %record.account,
                    generation = record.generation,
                    revoked,
                    "Refresh token reuse detected; family revoked"
                );
                AuthError::TokenReuseDetected {
                    family_id: record.family_id,
                }
            }
            Err(err) => {
                tracing::error!(
                    family_id = %record.family_id,
                    account = %record.account,
                    error = %err,
                    "Refresh token reuse detected but family revocation failed"
                );
                AuthError::Store(err)
            }
        }
    }

    pub async fn revoke_session(&self, family_id: FamilyId) -> Result<u64, AuthError> {
        let revoked = self.store.revoke_family(family_id).await?;
        tracing::info!(family_id = %family_id, revoked, "Session revoked");
        Ok(revoked)
    }

    pub async fn revoke_all_sessions(&self, account: AccountRef) -> Result<u64, AuthError> {
        let revoked = self.store.revoke_all(account).await?;
        tracing::info!(account = %account, revoked, "All sessions revoked");
        Ok(revoked)
    }

    pub async fn revoke_other_sessions(
        &self,
        account: AccountRef,
        keep: FamilyId,
    ) -> Result<u64, AuthError> {
        let revoked = self.store.revoke_all_except(account, keep).await?;
        tracing::info!(account = %account, kept = %keep, revoked, "Other sessions revoked");
        Ok(revoked)
    }

    pub async fn get_active_sessions(
        &self,
        account: AccountRef,
    ) -> Result<Vec<SessionRecord>, AuthError> {
        Ok(self
            .store
            .find_live_sessions(account, self.clock.now())
            .await?)
    }

    pub async fn active_session_count(&self, account: AccountRef) -> Result<u64, AuthError> {
        Ok(self
            .store
            .count_live_sessions(account, self.clock.now())
            .await?)
    }

    pub async fn family_history(&self, family_id: FamilyId) -> Result<Vec<SessionRecord>, AuthError> {
        Ok(self.store.family_records(family_id).await?)
    }

    pub async fn cleanup_expired(&self) -> Result<u64, AuthError> {
        let deleted = self.store.delete_expired(self.clock.now()).await?;
        tracing::info!(deleted, "Deleted expired refresh tokens");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionLimitPolicy, TokenConfig};
    use crate::models::account::AccountStatus;
    use crate::repositories::memory::MemorySessionStore;
    use crate::types::{ModeratorId, UserId};
    use crate::utils::time::ManualClock;
    use uuid::Uuid;

    struct Fixture {
        engine: SessionEngine,
        store: Arc<MemorySessionStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let codec = TokenCodec::new(
            &TokenConfig {
                secret: "session-engine-test-secret-32-bytes!".into(),
                issuer: "identity-test".into(),
                access_ttl_seconds: 900,
                refresh_ttl_seconds: 7 * 24 * 3600,
            },
            clock.clone(),
        )
        .expect("codec");
        let store = Arc::new(MemorySessionStore::new());
        let engine = SessionEngine::new(store.clone(), Arc::new(codec), clock.clone(), config);
        Fixture {
            engine,
            store,
            clock,
        }
    }

    fn user(id: i64) -> AuthenticatedAccount {
        AuthenticatedAccount {
            account: AccountRef::User(UserId::new(id)),
            uuid: Uuid::new_v4(),
            username: format!("user{id}"),
            roles: vec!["ROLE_USER".into()],
            status: AccountStatus::Active,
        }
    }

    fn moderator(id: i64) -> AuthenticatedAccount {
        AuthenticatedAccount {
            account: AccountRef::Moderator(ModeratorId::new(id)),
            uuid: Uuid::new_v4(),
            username: format!("mod{id}"),
            roles: vec!["ROLE_MODERATOR".into()],
            status: AccountStatus::Active,
        }
    }

    fn device(ip: &str) -> SessionInfo {
        SessionInfo::new(ip, Some("Mozilla/5.0"))
    }

    #[tokio::test]
    async fn create_session_starts_family_at_generation_one() {
        let fx = fixture(SessionConfig::default());
        let record = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        assert_eq!(record.generation, 1);
        assert!(record.is_live(fx.clock.now()));
        assert_eq!(record.lifetime(), Duration::hours(1));

        let claims = fx.engine.codec().require_refresh(&record.token).unwrap();
        assert_eq!(claims.family_id, record.family_id);
        assert_eq!(claims.generation, Some(1));
    }

    #[tokio::test]
    async fn remember_me_and_moderators_get_long_lifetime() {
        let fx = fixture(SessionConfig::default());
        let remembered = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), true)
            .await
            .unwrap();
        assert_eq!(remembered.lifetime(), Duration::days(7));

        let moderator = fx
            .engine
            .create_session(&moderator(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        assert_eq!(moderator.lifetime(), Duration::days(7));
    }

    #[tokio::test]
    async fn rotation_advances_generation_and_keeps_lifetime() {
        let fx = fixture(SessionConfig::default());
        let first = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.clock.advance(Duration::minutes(10));

        let second = fx
            .engine
            .rotate_token(&first.token, &device("10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(second.family_id, first.family_id);
        assert_eq!(second.generation, 2);
        assert_eq!(second.ip_address, "10.0.0.2");
        assert_eq!(second.lifetime(), first.lifetime());

        let history = fx.engine.family_history(first.family_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].used);
        assert_eq!(history[0].used_at, Some(fx.clock.now()));
        assert_eq!(history[0].replaced_by_token.as_deref(), Some(second.token.as_str()));
        assert!(history[1].is_live(fx.clock.now()));
    }

    #[tokio::test]
    async fn reusing_a_rotated_token_revokes_the_family() {
        let fx = fixture(SessionConfig::default());
        let first = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        let second = fx
            .engine
            .rotate_token(&first.token, &device("10.0.0.1"))
            .await
            .unwrap();

        let err = fx
            .engine
            .rotate_token(&first.token, &device("6.6.6.6"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenReuseDetected { family_id } if family_id == first.family_id));

        let history = fx.engine.family_history(first.family_id).await.unwrap();
        assert!(history.iter().all(|r| r.revoked));

        // The live successor is dead too.
        let err = fx
            .engine
            .rotate_token(&second.token, &device("10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Revoked));
    }

    #[tokio::test]
    async fn used_token_is_reuse_even_after_it_expired() {
        let fx = fixture(SessionConfig::default());
        let first = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.engine
            .rotate_token(&first.token, &device("10.0.0.1"))
            .await
            .unwrap();

        fx.clock.advance(Duration::hours(2));
        assert!(fx.engine.codec().require_refresh(&first.token).is_err());
        let err = fx
            .engine
            .rotate_token(&first.token, &device("6.6.6.6"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenReuseDetected { .. }));
        let history = fx.engine.family_history(first.family_id).await.unwrap();
        assert!(history.iter().all(|r| r.revoked));
    }

    #[tokio::test]
    async fn rotate_rejects_unknown_revoked_and_expired_tokens() {
        let fx = fixture(SessionConfig::default());
        assert!(matches!(
            fx.engine.rotate_token("missing", &device("10.0.0.1")).await,
            Err(AuthError::NotFound)
        ));

        let revoked = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.engine.revoke_session(revoked.family_id).await.unwrap();
        assert!(matches!(
            fx.engine.rotate_token(&revoked.token, &device("10.0.0.1")).await,
            Err(AuthError::Revoked)
        ));

        let expiring = fx
            .engine
            .create_session(&user(2), &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(2));
        assert!(matches!(
            fx.engine.rotate_token(&expiring.token, &device("10.0.0.1")).await,
            Err(AuthError::Expired)
        ));
        // Expiry alone does not revoke anything.
        let history = fx.engine.family_history(expiring.family_id).await.unwrap();
        assert!(!history[0].revoked && !history[0].used);
    }

    #[tokio::test]
    async fn session_cap_evicts_oldest_family() {
        let fx = fixture(SessionConfig {
            max_sessions_per_user: 2,
            ..SessionConfig::default()
        });
        let account = user(1);
        let oldest = fx
            .engine
            .create_session(&account, &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.clock.advance(Duration::seconds(1));
        let middle = fx
            .engine
            .create_session(&account, &device("10.0.0.2"), false)
            .await
            .unwrap();
        fx.clock.advance(Duration::seconds(1));
        let newest = fx
            .engine
            .create_session(&account, &device("10.0.0.3"), false)
            .await
            .unwrap();

        let live = fx.engine.get_active_sessions(account.account).await.unwrap();
        let families: Vec<FamilyId> = live.iter().map(|r| r.family_id).collect();
        assert_eq!(families, vec![newest.family_id, middle.family_id]);
        assert!(fx
            .engine
            .family_history(oldest.family_id)
            .await
            .unwrap()
            .iter()
            .all(|r| r.revoked));
    }

    #[tokio::test]
    async fn caps_are_per_account_type() {
        let fx = fixture(SessionConfig {
            max_sessions_per_user: 5,
            max_sessions_per_moderator: 1,
            ..SessionConfig::default()
        });
        let moderator = moderator(1);
        fx.engine
            .create_session(&moderator, &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.engine
            .create_session(&moderator, &device("10.0.0.2"), false)
            .await
            .unwrap();
        assert_eq!(fx.engine.active_session_count(moderator.account).await.unwrap(), 1);

        let user = user(1);
        for _ in 0..3 {
            fx.engine
                .create_session(&user, &device("10.0.0.1"), false)
                .await
                .unwrap();
        }
        assert_eq!(fx.engine.active_session_count(user.account).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reject_policy_refuses_new_sessions() {
        let fx = fixture(SessionConfig {
            max_sessions_per_user: 1,
            limit_policy: SessionLimitPolicy::Reject,
            ..SessionConfig::default()
        });
        let account = user(1);
        fx.engine
            .create_session(&account, &device("10.0.0.1"), false)
            .await
            .unwrap();
        let err = fx
            .engine
            .create_session(&account, &device("10.0.0.2"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionLimitExceeded { max: 1 }));
        assert!(matches!(
            fx.engine.enforce_session_limit(account.account).await,
            Err(AuthError::SessionLimitExceeded { max: 1 })
        ));
    }

    #[tokio::test]
    async fn enforce_session_limit_reports_evicted_families() {
        let fx = fixture(SessionConfig {
            max_sessions_per_user: 1,
            ..SessionConfig::default()
        });
        let account = user(1);
        assert!(fx
            .engine
            .enforce_session_limit(account.account)
            .await
            .unwrap()
            .is_empty());
        let only = fx
            .engine
            .create_session(&account, &device("10.0.0.1"), false)
            .await
            .unwrap();
        assert_eq!(
            fx.engine.enforce_session_limit(account.account).await.unwrap(),
            vec![only.family_id]
        );
    }

    #[tokio::test]
    async fn revocation_is_idempotent() {
        let fx = fixture(SessionConfig::default());
        let record = fx
            .engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        assert_eq!(fx.engine.revoke_session(record.family_id).await.unwrap(), 1);
        let after_first = fx.store.snapshot().await;
        assert_eq!(fx.engine.revoke_session(record.family_id).await.unwrap(), 0);
        assert_eq!(fx.store.snapshot().await, after_first);
    }

    #[tokio::test]
    async fn revoke_all_and_others_scope_to_account() {
        let fx = fixture(SessionConfig::default());
        let alice = user(1);
        let bob = user(2);
        let keep = fx
            .engine
            .create_session(&alice, &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.engine
            .create_session(&alice, &device("10.0.0.2"), false)
            .await
            .unwrap();
        fx.engine
            .create_session(&bob, &device("10.0.0.3"), false)
            .await
            .unwrap();

        assert_eq!(
            fx.engine
                .revoke_other_sessions(alice.account, keep.family_id)
                .await
                .unwrap(),
            1
        );
        assert_eq!(fx.engine.active_session_count(alice.account).await.unwrap(), 1);

        fx.engine.revoke_all_sessions(alice.account).await.unwrap();
        assert_eq!(fx.engine.active_session_count(alice.account).await.unwrap(), 0);
        assert_eq!(fx.engine.active_session_count(bob.account).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_records() {
        let fx = fixture(SessionConfig::default());
        fx.engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(2));
        fx.engine
            .create_session(&user(1), &device("10.0.0.1"), false)
            .await
            .unwrap();

        assert_eq!(fx.engine.cleanup_expired().await.unwrap(), 1);
        assert_eq!(fx.store.snapshot().await.len(), 1);
    }
}

#![allow(dead_code)]
use async_trait::async_trait;
use identity_backend::{
    config::{Config, MaintenanceConfig, RateLimitConfig, SessionConfig, TokenConfig},
    models::account::{AccountRef, AccountStatus, AccountType, AuthenticatedAccount},
    models::session::SessionInfo,
    repositories::{MemoryAttemptLedger, MemorySessionStore},
    services::{AuthService, CredentialError, CredentialVerifier},
    state::AppState,
    types::{ModeratorId, UserId},
    utils::time::ManualClock,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{collections::HashMap, env, sync::Arc, sync::Mutex};
use uuid::Uuid;

pub const TEST_SECRET: &str = "integration-test-secret-at-least-32-bytes";

pub fn test_config() -> Config {
    Config {
        database_url: test_database_url()
            .unwrap_or_else(|| "postgres://localhost/identity_test".to_string()),
        token: TokenConfig {
            secret: TEST_SECRET.to_string(),
            issuer: "identity-test".to_string(),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 7 * 24 * 3600,
        },
        session: SessionConfig::default(),
        rate_limit: RateLimitConfig::default(),
        maintenance: MaintenanceConfig::default(),
    }
}

pub fn device(ip: &str) -> SessionInfo {
    SessionInfo::new(ip, Some("Mozilla/5.0 (X11; Linux x86_64)"))
}

struct Entry {
    password: String,
    account: AuthenticatedAccount,
}

/// Account store double keyed by `(account type, lower-cased handle)`.
#[derive(Default)]
pub struct FakeDirectory {
    entries: Mutex<HashMap<(AccountType, String), Entry>>,
}

impl FakeDirectory {
    pub fn add_user(&self, id: i64, username: &str, password: &str) -> AuthenticatedAccount {
        self.add(AccountRef::User(UserId::new(id)), username, password, "ROLE_USER")
    }

    pub fn add_moderator(&self, id: i64, username: &str, password: &str) -> AuthenticatedAccount {
        self.add(
            AccountRef::Moderator(ModeratorId::new(id)),
            username,
            password,
            "ROLE_MODERATOR",
        )
    }

    fn add(
        &self,
        account: AccountRef,
        username: &str,
        password: &str,
        role: &str,
    ) -> AuthenticatedAccount {
        let authenticated = AuthenticatedAccount {
            account,
            uuid: Uuid::new_v4(),
            username: username.to_string(),
            roles: vec![role.to_string()],
            status: AccountStatus::Active,
        };
        self.entries.lock().expect("lock directory").insert(
            (account.account_type(), username.to_lowercase()),
            Entry {
                password: password.to_string(),
                account: authenticated.clone(),
            },
        );
        authenticated
    }

    pub fn set_status(&self, account_type: AccountType, username: &str, status: AccountStatus) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("lock directory")
            .get_mut(&(account_type, username.to_lowercase()))
        {
            entry.account.status = status;
        }
    }
}

#[async_trait]
impl CredentialVerifier for FakeDirectory {
    async fn verify(
        &self,
        identifier: &str,
        password: &str,
        account_type: AccountType,
    ) -> Result<AuthenticatedAccount, CredentialError> {
        let entries = self.entries.lock().expect("lock directory");
        let entry = entries
            .get(&(account_type, identifier.trim().to_lowercase()))
            .ok_or(CredentialError::UnknownAccount)?;
        if entry.password != password {
            return Err(CredentialError::InvalidCredentials);
        }
        Ok(entry.account.clone())
    }

    async fn find_account(
        &self,
        account_type: AccountType,
        uuid: Uuid,
    ) -> Result<Option<AuthenticatedAccount>, CredentialError> {
        let entries = self.entries.lock().expect("lock directory");
        Ok(entries
            .iter()
            .find(|((kind, _), entry)| *kind == account_type && entry.account.uuid == uuid)
            .map(|(_, entry)| entry.account.clone()))
    }
}

/// Memory-backed service with a controllable clock.
pub struct Harness {
    pub auth: AuthService,
    pub state: AppState,
    pub directory: Arc<FakeDirectory>,
    pub store: Arc<MemorySessionStore>,
    pub ledger: Arc<MemoryAttemptLedger>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let directory = Arc::new(FakeDirectory::default());
        let store = Arc::new(MemorySessionStore::new());
        let ledger = Arc::new(MemoryAttemptLedger::new());
        let clock = Arc::new(ManualClock::default());
        let state = AppState::new(config, store.clone(), ledger.clone(), clock.clone())
            .expect("build state");
        let auth = state.auth_service(directory.clone());
        Self {
            auth,
            state,
            directory,
            store,
            ledger,
            clock,
        }
    }
}

pub fn test_database_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok().filter(|url| !url.is_empty())
}

/// Migrated pool on `TEST_DATABASE_URL`, or `None` when it is not set.
pub async fn test_pool() -> Option<PgPool> {
    let url = test_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

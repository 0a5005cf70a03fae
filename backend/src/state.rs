use std::sync::Arc;

use crate::config::Config;
use crate::db::connection::DbPool;
use crate::repositories::{
    AttemptLedger, MemoryAttemptLedger, MemorySessionStore, PgAttemptLedger, PgSessionStore,
    SessionStore,
};
use crate::services::{AuthService, CredentialVerifier, LoginGuard, MaintenanceWorker, SessionEngine};
use crate::utils::jwt::{TokenCodec, TokenError};
use crate::utils::time::{Clock, SystemClock};

/// Shared wiring of the session core. The credential verifier is supplied by
/// the embedding service when it builds an [`AuthService`].
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionEngine>,
    pub guard: Arc<LoginGuard>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn SessionStore>,
        ledger: Arc<dyn AttemptLedger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenError> {
        let codec = Arc::new(TokenCodec::new(&config.token, clock.clone())?);
        let sessions = Arc::new(SessionEngine::new(
            store,
            codec,
            clock.clone(),
            config.session.clone(),
        ));
        let guard = Arc::new(LoginGuard::new(ledger, clock, config.rate_limit.clone()));
        Ok(Self {
            config,
            sessions,
            guard,
        })
    }

    /// Postgres-backed stores on the given pool.
    pub fn with_pool(config: Config, pool: &DbPool) -> Result<Self, TokenError> {
        let pool = pool.as_ref().clone();
        Self::new(
            config,
            Arc::new(PgSessionStore::new(pool.clone())),
            Arc::new(PgAttemptLedger::new(pool)),
            Arc::new(SystemClock),
        )
    }

    /// In-process stores, for local development.
    pub fn in_memory(config: Config) -> Result<Self, TokenError> {
        Self::new(
            config,
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryAttemptLedger::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn auth_service(&self, verifier: Arc<dyn CredentialVerifier>) -> AuthService {
        AuthService::new(verifier, self.guard.clone(), self.sessions.clone())
    }

    pub fn maintenance_worker(&self) -> MaintenanceWorker {
        MaintenanceWorker::new(
            self.sessions.clone(),
            self.guard.clone(),
            self.config.maintenance.clone(),
        )
    }
}

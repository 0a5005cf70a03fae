//! Periodic retention sweeps. Failures are logged and retried on the next
//! tick; skipping a sweep only delays space reclamation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::MaintenanceConfig;
use crate::services::login_guard::LoginGuard;
use crate::services::session::SessionEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// `None` when the sweep failed.
    pub sessions_deleted: Option<u64>,
    pub attempts_purged: Option<u64>,
}

pub struct MaintenanceWorker {
    sessions: Arc<SessionEngine>,
    guard: Arc<LoginGuard>,
    config: MaintenanceConfig,
}

impl MaintenanceWorker {
    pub fn new(sessions: Arc<SessionEngine>, guard: Arc<LoginGuard>, config: MaintenanceConfig) -> Self {
        Self {
            sessions,
            guard,
            config,
        }
    }

    pub async fn sweep_sessions(&self) -> Option<u64> {
        match self.sessions.cleanup_expired().await {
            Ok(deleted) => Some(deleted),
            Err(err) => {
                tracing::warn!(error = %err, "Expired session sweep failed");
                None
            }
        }
    }

    pub async fn sweep_attempts(&self) -> Option<u64> {
        match self.guard.purge_expired().await {
            Ok(purged) => Some(purged),
            Err(err) => {
                tracing::warn!(error = %err, "Login attempt retention sweep failed");
                None
            }
        }
    }

    pub async fn run_once(&self) -> SweepReport {
        SweepReport {
            sessions_deleted: self.sweep_sessions().await,
            attempts_purged: self.sweep_attempts().await,
        }
    }

    /// Runs both sweeps on their own intervals until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut session_tick =
            interval(Duration::from_secs(self.config.session_sweep_interval_seconds.max(1)));
        session_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempt_tick =
            interval(Duration::from_secs(self.config.attempt_sweep_interval_seconds.max(1)));
        attempt_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Maintenance worker stopping");
                    break;
                }
                _ = session_tick.tick() => {
                    self.sweep_sessions().await;
                }
                _ = attempt_tick.tick() => {
                    self.sweep_attempts().await;
                }
            }
        }
    }
}

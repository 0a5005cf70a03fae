//! Brute-force mitigation over the attempt ledger.
//!
//! Lockouts are never stored. Each check recounts failures in the sliding
//! window and anchors the lockout on the most recent failure, so an expired
//! lockout needs no reset and a fresh burst re-locks from its own anchor.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::RateLimitConfig;
use crate::error::AuthError;
use crate::models::account::AccountType;
use crate::models::login_attempt::{normalize_identifier, FailureReason, NewLoginAttempt};
use crate::models::session::SessionInfo;
use crate::repositories::login_attempt::AttemptLedger;
use crate::utils::time::{minutes_until, Clock};

pub struct LoginGuard {
    ledger: Arc<dyn AttemptLedger>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl LoginGuard {
    pub fn new(ledger: Arc<dyn AttemptLedger>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            ledger,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.attempt_window()
    }

    /// Rejects the attempt if either the identity or the IP counter is over
    /// its threshold and the matching lockout has not yet run out.
    pub async fn check_login_allowed(&self, identifier: &str, ip: &str) -> Result<(), AuthError> {
        let identifier = normalize_identifier(identifier);
        let now = self.clock.now();
        let since = self.window_start(now);

        let failures = self.ledger.count_failed_by_identifier(&identifier, since).await?;
        if failures >= u64::from(self.config.max_failed_attempts) {
            if let Some(last) = self.ledger.last_failed_by_identifier(&identifier, since).await? {
                let locked_until = last + self.config.lockout_duration();
                if locked_until > now {
                    let remaining_minutes = minutes_until(now, locked_until);
                    tracing::warn!(
                        identifier = %identifier,
                        failures,
                        %locked_until,
                        remaining_minutes,
                        "Login blocked: account locked"
                    );
                    return Err(AuthError::AccountLocked {
                        locked_until,
                        remaining_minutes,
                    });
                }
            }
        }

        let failures = self.ledger.count_failed_by_ip(ip, since).await?;
        if failures >= u64::from(self.config.max_failed_attempts_per_ip) {
            if let Some(last) = self.ledger.last_failed_by_ip(ip, since).await? {
                let blocked_until = last + self.config.ip_block_duration();
                if blocked_until > now {
                    let retry_after_minutes = minutes_until(now, blocked_until);
                    tracing::warn!(
                        ip,
                        failures,
                        %blocked_until,
                        retry_after_minutes,
                        "Login blocked: too many failures from address"
                    );
                    return Err(AuthError::TooManyRequests {
                        retry_after_minutes,
                    });
                }
            }
        }

        Ok(())
    }

    pub async fn record_success(
        &self,
        identifier: &str,
        info: &SessionInfo,
        account_type: AccountType,
    ) -> Result<(), AuthError> {
        let attempt = NewLoginAttempt::success(
            identifier,
            &info.ip_address,
            info.user_agent.as_deref(),
            account_type,
            self.clock.now(),
        );
        self.ledger.record(attempt).await?;
        Ok(())
    }

    /// Records the failure and returns how many attempts the identity has
    /// left before it is locked.
    pub async fn record_failure(
        &self,
        identifier: &str,
        info: &SessionInfo,
        account_type: AccountType,
        reason: FailureReason,
    ) -> Result<u32, AuthError> {
        let attempt = NewLoginAttempt::failure(
            identifier,
            &info.ip_address,
            info.user_agent.as_deref(),
            account_type,
            reason,
            self.clock.now(),
        );
        self.ledger.record(attempt).await?;

        let remaining = self.remaining_attempts(identifier).await?;
        tracing::warn!(
            identifier = %normalize_identifier(identifier),
            ip = %info.ip_address,
            reason = reason.as_str(),
            remaining_attempts = remaining,
            "Failed login attempt"
        );
        Ok(remaining)
    }

    pub async fn remaining_attempts(&self, identifier: &str) -> Result<u32, AuthError> {
        let identifier = normalize_identifier(identifier);
        let since = self.window_start(self.clock.now());
        let failures = self.ledger.count_failed_by_identifier(&identifier, since).await?;
        let max = u64::from(self.config.max_failed_attempts);
        Ok(max.saturating_sub(failures) as u32)
    }

    /// Drops attempts older than the retention period.
    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        let cutoff = self.clock.now() - self.config.attempt_retention();
        let purged = self.ledger.purge_older_than(cutoff).await?;
        tracing::info!(purged, %cutoff, "Purged old login attempts");
        Ok(purged)
    }
}

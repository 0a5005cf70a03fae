use anyhow::{anyhow, ensure, Context};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::str::FromStr;

use crate::models::account::AccountType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(skip_serializing)]
    pub secret: String,
    pub issuer: String,
    pub access_ttl_seconds: i64,
    /// Lifetime of refresh tokens for remember-me and moderator sessions.
    pub refresh_ttl_seconds: i64,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &mask_secret(&self.secret))
            .field("issuer", &self.issuer)
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .finish()
    }
}

impl TokenConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::seconds(self.access_ttl_seconds)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::seconds(self.refresh_ttl_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What happens when an account already holds its maximum number of sessions.
pub enum SessionLimitPolicy {
    /// Revoke the family with the oldest live record, then continue.
    EvictOldest,
    /// Refuse the new session with `SessionLimitExceeded`.
    Reject,
}

impl FromStr for SessionLimitPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evict_oldest" | "evict" => Ok(SessionLimitPolicy::EvictOldest),
            "reject" => Ok(SessionLimitPolicy::Reject),
            other => Err(anyhow!("unknown session limit policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_sessions_per_user: u32,
    pub max_sessions_per_moderator: u32,
    /// Refresh lifetime for user sessions created without remember-me.
    pub default_ttl_seconds: i64,
    pub limit_policy: SessionLimitPolicy,
}

impl SessionConfig {
    pub fn max_sessions(&self, account_type: AccountType) -> u32 {
        match account_type {
            AccountType::User => self.max_sessions_per_user,
            AccountType::Moderator => self.max_sessions_per_moderator,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::seconds(self.default_ttl_seconds)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            max_sessions_per_moderator: 3,
            default_ttl_seconds: 3600,
            limit_policy: SessionLimitPolicy::EvictOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Brute-force thresholds. Identity and IP counters use the same window but
/// independent thresholds and durations.
pub struct RateLimitConfig {
    pub max_failed_attempts: u32,
    pub lockout_duration_minutes: i64,
    pub max_failed_attempts_per_ip: u32,
    pub ip_block_duration_minutes: i64,
    pub attempt_window_minutes: i64,
    pub attempt_retention_days: i64,
}

impl RateLimitConfig {
    pub fn attempt_window(&self) -> Duration {
        Duration::minutes(self.attempt_window_minutes)
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::minutes(self.lockout_duration_minutes)
    }

    pub fn ip_block_duration(&self) -> Duration {
        Duration::minutes(self.ip_block_duration_minutes)
    }

    pub fn attempt_retention(&self) -> Duration {
        Duration::days(self.attempt_retention_days)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_duration_minutes: 15,
            max_failed_attempts_per_ip: 20,
            ip_block_duration_minutes: 30,
            attempt_window_minutes: 60,
            attempt_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub session_sweep_interval_seconds: u64,
    pub attempt_sweep_interval_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            session_sweep_interval_seconds: 6 * 60 * 60,
            attempt_sweep_interval_seconds: 24 * 60 * 60,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup; `load` passes
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/identity".to_string());

        let secret = lookup("JWT_SECRET").context("JWT_SECRET must be set")?;
        let token = TokenConfig {
            secret,
            issuer: lookup("JWT_ISSUER").unwrap_or_else(|| "identity-service".to_string()),
            access_ttl_seconds: parse_or(&lookup, "ACCESS_TOKEN_TTL_SECONDS", 900)?,
            refresh_ttl_seconds: parse_or(&lookup, "REFRESH_TOKEN_TTL_SECONDS", 7 * 24 * 3600)?,
        };
        ensure!(token.access_ttl_seconds > 0, "ACCESS_TOKEN_TTL_SECONDS must be positive");
        ensure!(token.refresh_ttl_seconds > 0, "REFRESH_TOKEN_TTL_SECONDS must be positive");

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            max_sessions_per_user: parse_or(
                &lookup,
                "MAX_SESSIONS_PER_USER",
                session_defaults.max_sessions_per_user,
            )?,
            max_sessions_per_moderator: parse_or(
                &lookup,
                "MAX_SESSIONS_PER_MODERATOR",
                session_defaults.max_sessions_per_moderator,
            )?,
            default_ttl_seconds: parse_or(
                &lookup,
                "SESSION_DEFAULT_TTL_SECONDS",
                session_defaults.default_ttl_seconds,
            )?,
            limit_policy: parse_or(
                &lookup,
                "SESSION_LIMIT_POLICY",
                session_defaults.limit_policy,
            )?,
        };
        ensure!(session.max_sessions_per_user > 0, "MAX_SESSIONS_PER_USER must be at least 1");
        ensure!(
            session.max_sessions_per_moderator > 0,
            "MAX_SESSIONS_PER_MODERATOR must be at least 1"
        );
        ensure!(session.default_ttl_seconds > 0, "SESSION_DEFAULT_TTL_SECONDS must be positive");

        let limits = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            max_failed_attempts: parse_or(
                &lookup,
                "RATE_LIMIT_MAX_FAILED_ATTEMPTS",
                limits.max_failed_attempts,
            )?,
            lockout_duration_minutes: parse_or(
                &lookup,
                "RATE_LIMIT_LOCKOUT_DURATION_MINUTES",
                limits.lockout_duration_minutes,
            )?,
            max_failed_attempts_per_ip: parse_or(
                &lookup,
                "RATE_LIMIT_MAX_FAILED_ATTEMPTS_PER_IP",
                limits.max_failed_attempts_per_ip,
            )?,
            ip_block_duration_minutes: parse_or(
                &lookup,
                "RATE_LIMIT_IP_BLOCK_DURATION_MINUTES",
                limits.ip_block_duration_minutes,
            )?,
            attempt_window_minutes: parse_or(
                &lookup,
                "RATE_LIMIT_ATTEMPT_WINDOW_MINUTES",
                limits.attempt_window_minutes,
            )?,
            attempt_retention_days: parse_or(
                &lookup,
                "RATE_LIMIT_ATTEMPT_RETENTION_DAYS",
                limits.attempt_retention_days,
            )?,
        };
        ensure!(rate_limit.max_failed_attempts > 0, "RATE_LIMIT_MAX_FAILED_ATTEMPTS must be at least 1");
        ensure!(
            rate_limit.max_failed_attempts_per_ip > 0,
            "RATE_LIMIT_MAX_FAILED_ATTEMPTS_PER_IP must be at least 1"
        );
        ensure!(
            rate_limit.attempt_window_minutes > 0,
            "RATE_LIMIT_ATTEMPT_WINDOW_MINUTES must be positive"
        );

        let sweeps = MaintenanceConfig::default();
        let maintenance = MaintenanceConfig {
            session_sweep_interval_seconds: parse_or(
                &lookup,
                "SESSION_SWEEP_INTERVAL_SECONDS",
                sweeps.session_sweep_interval_seconds,
            )?,
            attempt_sweep_interval_seconds: parse_or(
                &lookup,
                "ATTEMPT_SWEEP_INTERVAL_SECONDS",
                sweeps.attempt_sweep_interval_seconds,
            )?,
        };

        Ok(Config {
            database_url,
            token,
            session,
            rate_limit,
            maintenance,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} value {:?}: {}", key, raw, e)),
        _ => Ok(default),
    }
}

/// Renders a secret for logs without revealing it.
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

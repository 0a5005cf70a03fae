//! Append-only login attempt ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::account::AccountType;
use crate::models::login_attempt::{LoginAttempt, NewLoginAttempt};

/// Windowed aggregates are always computed fresh from the stored attempts.
/// Identifiers passed in must already be normalised.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Commits immediately, independent of any caller transaction.
    async fn record(&self, attempt: NewLoginAttempt) -> Result<LoginAttempt, StoreError>;

    async fn count_failed_by_identifier(
        &self,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn count_failed_by_ip(&self, ip: &str, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn last_failed_by_identifier(
        &self,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn last_failed_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: i64,
    identifier: String,
    ip_address: String,
    user_agent: Option<String>,
    successful: bool,
    failure_reason: Option<String>,
    account_type: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for LoginAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let account_type: AccountType = row
            .account_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("login_attempts.id={}: {}", row.id, e)))?;
        Ok(LoginAttempt {
            id: row.id,
            identifier: row.identifier,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            successful: row.successful,
            failure_reason: row.failure_reason,
            account_type,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgAttemptLedger {
    pool: PgPool,
}

impl PgAttemptLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttemptLedger for PgAttemptLedger {
    async fn record(&self, attempt: NewLoginAttempt) -> Result<LoginAttempt, StoreError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            INSERT INTO login_attempts
                (identifier, ip_address, user_agent, successful, failure_reason, account_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, identifier, ip_address, user_agent, successful, failure_reason, account_type, created_at
            "#,
        )
        .bind(&attempt.identifier)
        .bind(&attempt.ip_address)
        .bind(attempt.user_agent.as_deref())
        .bind(attempt.successful)
        .bind(attempt.failure_reason.as_deref())
        .bind(attempt.account_type.as_str())
        .bind(attempt.created_at)
        .fetch_one(&self.pool)
        .await?;
        LoginAttempt::try_from(row)
    }

    async fn count_failed_by_identifier(
        &self,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM login_attempts
            WHERE identifier = $1 AND successful = FALSE AND created_at > $2
            "#,
        )
        .bind(identifier)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_failed_by_ip(&self, ip: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM login_attempts
            WHERE ip_address = $1 AND successful = FALSE AND created_at > $2
            "#,
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn last_failed_by_identifier(
        &self,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(created_at) FROM login_attempts
            WHERE identifier = $1 AND successful = FALSE AND created_at > $2
            "#,
        )
        .bind(identifier)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn last_failed_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(created_at) FROM login_attempts
            WHERE ip_address = $1 AND successful = FALSE AND created_at > $2
            "#,
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

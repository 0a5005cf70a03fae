//! Refresh-token session persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgTransaction;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::SessionLimitPolicy;
use crate::error::StoreError;
use crate::models::account::{AccountRef, AccountType};
use crate::models::session::{NewSession, SessionRecord};
use crate::repositories::transaction::{begin_transaction, commit_transaction, lock_account};
use crate::types::FamilyId;

/// Cap applied to one account's live sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimit {
    pub max: u32,
    pub policy: SessionLimitPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitOutcome {
    /// Below the cap; nothing changed.
    Within,
    /// The listed families were revoked, oldest first, to make room for one more.
    Evicted(Vec<FamilyId>),
    /// At the cap and the policy forbids eviction.
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created {
        record: SessionRecord,
        evicted: Vec<FamilyId>,
    },
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated(SessionRecord),
    /// The predecessor was no longer live when the conditional update ran.
    Conflict,
}

/// Persistence seam for session records.
///
/// Implementations must make `create` (cap enforcement plus insert) and
/// `rotate` (mark predecessor used plus insert successor) atomic, and must
/// commit `revoke_family` independently of any other unit of work.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_by_token(&self, token: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn create(
        &self,
        session: NewSession,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, StoreError>;

    async fn enforce_limit(
        &self,
        account: AccountRef,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<LimitOutcome, StoreError>;

    /// Marks `predecessor_id` used and inserts `successor`, but only if the
    /// predecessor is still unused and unrevoked.
    async fn rotate(
        &self,
        predecessor_id: i64,
        used_at: DateTime<Utc>,
        successor: NewSession,
    ) -> Result<RotationOutcome, StoreError>;

    async fn revoke_family(&self, family_id: FamilyId) -> Result<u64, StoreError>;

    async fn revoke_all(&self, account: AccountRef) -> Result<u64, StoreError>;

    async fn revoke_all_except(
        &self,
        account: AccountRef,
        keep: FamilyId,
    ) -> Result<u64, StoreError>;

    /// Live records for the account, newest first.
    async fn find_live_sessions(
        &self,
        account: AccountRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    async fn count_live_sessions(
        &self,
        account: AccountRef,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Every record of a family ordered by generation.
    async fn family_records(&self, family_id: FamilyId) -> Result<Vec<SessionRecord>, StoreError>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

const SESSION_COLUMNS: &str = "id, token, family_id, generation, account_type, user_id, \
     moderator_id, ip_address, user_agent, created_at, expires_at, used, used_at, revoked, \
     replaced_by_token";

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: i64,
    token: String,
    family_id: Uuid,
    generation: i32,
    account_type: String,
    user_id: Option<i64>,
    moderator_id: Option<i64>,
    ip_address: String,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    used: bool,
    used_at: Option<DateTime<Utc>>,
    revoked: bool,
    replaced_by_token: Option<String>,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let account_type: AccountType = row
            .account_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("refresh_tokens.id={}: {}", row.id, e)))?;
        let account = AccountRef::from_columns(account_type, row.user_id, row.moderator_id)
            .map_err(|e| StoreError::Corrupt(format!("refresh_tokens.id={}: {}", row.id, e)))?;
        Ok(SessionRecord {
            id: row.id,
            token: row.token,
            family_id: FamilyId::from_uuid(row.family_id),
            generation: row.generation,
            account,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            created_at: row.created_at,
            expires_at: row.expires_at,
            used: row.used,
            used_at: row.used_at,
            revoked: row.revoked,
            replaced_by_token: row.replaced_by_token,
        })
    }
}

fn into_records(rows: Vec<SessionRow>) -> Result<Vec<SessionRecord>, StoreError> {
    rows.into_iter().map(SessionRecord::try_from).collect()
}

/// Column holding the account key for the reference's kind, and the key.
fn account_column(account: AccountRef) -> (&'static str, i64) {
    match account {
        AccountRef::User(id) => ("user_id", id.get()),
        AccountRef::Moderator(id) => ("moderator_id", id.get()),
    }
}

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        tx: &mut PgTransaction<'_>,
        session: &NewSession,
    ) -> Result<SessionRecord, StoreError> {
        let query = format!(
            "INSERT INTO refresh_tokens \
                (token, family_id, generation, account_type, user_id, moderator_id, \
                 ip_address, user_agent, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(&session.token)
            .bind(*session.family_id.as_uuid())
            .bind(session.generation)
            .bind(session.account.account_type().as_str())
            .bind(session.account.user_id().map(|id| id.get()))
            .bind(session.account.moderator_id().map(|id| id.get()))
            .bind(&session.ip_address)
            .bind(session.user_agent.as_deref())
            .bind(session.created_at)
            .bind(session.expires_at)
            .fetch_one(&mut **tx)
            .await?;
        SessionRecord::try_from(row)
    }

    /// Caller must hold the account's advisory lock.
    async fn enforce_limit_locked(
        tx: &mut PgTransaction<'_>,
        account: AccountRef,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<LimitOutcome, StoreError> {
        let (column, key) = account_column(account);
        let query = format!(
            "SELECT family_id FROM refresh_tokens \
             WHERE {column} = $1 AND used = FALSE AND revoked = FALSE AND expires_at >= $2 \
             ORDER BY created_at ASC, id ASC"
        );
        let live: Vec<Uuid> = sqlx::query_scalar(&query)
            .bind(key)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?;

        let max = limit.max as usize;
        if live.len() < max {
            return Ok(LimitOutcome::Within);
        }
        if limit.policy == SessionLimitPolicy::Reject {
            return Ok(LimitOutcome::Exceeded);
        }

        let excess = eviction_count(live.len(), max);
        let evict: Vec<Uuid> = live.into_iter().take(excess).collect();
        sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE \
             WHERE family_id = ANY($1) AND revoked = FALSE",
        )
        .bind(&evict[..])
        .execute(&mut **tx)
        .await?;
        Ok(LimitOutcome::Evicted(
            evict.into_iter().map(FamilyId::from_uuid).collect(),
        ))
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM refresh_tokens WHERE token = $1");
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(SessionRecord::try_from)
            .transpose()
    }

    async fn create(
        &self,
        session: NewSession,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;
        lock_account(&mut tx, &session.account.to_string()).await?;

        let evicted = match Self::enforce_limit_locked(&mut tx, session.account, limit, now).await? {
            LimitOutcome::Exceeded => return Ok(CreateOutcome::LimitReached),
            LimitOutcome::Within => Vec::new(),
            LimitOutcome::Evicted(families) => families,
        };
        let record = Self::insert(&mut tx, &session).await?;
        commit_transaction(tx).await?;
        Ok(CreateOutcome::Created { record, evicted })
    }

    async fn enforce_limit(
        &self,
        account: AccountRef,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<LimitOutcome, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;
        lock_account(&mut tx, &account.to_string()).await?;
        let outcome = Self::enforce_limit_locked(&mut tx, account, limit, now).await?;
        commit_transaction(tx).await?;
        Ok(outcome)
    }

    async fn rotate(
        &self,
        predecessor_id: i64,
        used_at: DateTime<Utc>,
        successor: NewSession,
    ) -> Result<RotationOutcome, StoreError> {
        let mut tx = begin_transaction(&self.pool).await?;
        let claimed = sqlx::query(
            "UPDATE refresh_tokens \
             SET used = TRUE, used_at = $1, replaced_by_token = $2 \
             WHERE id = $3 AND used = FALSE AND revoked = FALSE",
        )
        .bind(used_at)
        .bind(&successor.token)
        .bind(predecessor_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            // Dropping the transaction rolls it back.
            return Ok(RotationOutcome::Conflict);
        }

        let record = Self::insert(&mut tx, &successor).await?;
        commit_transaction(tx).await?;
        Ok(RotationOutcome::Rotated(record))
    }

    async fn revoke_family(&self, family_id: FamilyId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE family_id = $1 AND revoked = FALSE",
        )
        .bind(*family_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all(&self, account: AccountRef) -> Result<u64, StoreError> {
        let (column, key) = account_column(account);
        let query = format!(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE {column} = $1 AND revoked = FALSE"
        );
        let result = sqlx::query(&query).bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_except(
        &self,
        account: AccountRef,
        keep: FamilyId,
    ) -> Result<u64, StoreError> {
        let (column, key) = account_column(account);
        let query = format!(
            "UPDATE refresh_tokens SET revoked = TRUE \
             WHERE {column} = $1 AND family_id <> $2 AND revoked = FALSE"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(*keep.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_live_sessions(
        &self,
        account: AccountRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let (column, key) = account_column(account);
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM refresh_tokens \
             WHERE {column} = $1 AND used = FALSE AND revoked = FALSE AND expires_at >= $2 \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(key)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    async fn count_live_sessions(
        &self,
        account: AccountRef,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let (column, key) = account_column(account);
        let query = format!(
            "SELECT COUNT(*) FROM refresh_tokens \
             WHERE {column} = $1 AND used = FALSE AND revoked = FALSE AND expires_at >= $2"
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(key)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn family_records(&self, family_id: FamilyId) -> Result<Vec<SessionRecord>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM refresh_tokens WHERE family_id = $1 ORDER BY generation ASC"
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(*family_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Oldest families to evict so that one more session fits under `max`.
pub(crate) fn eviction_count(live: usize, max: usize) -> usize {
    (live + 1).saturating_sub(max)
}

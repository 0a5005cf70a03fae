//! Transaction helpers shared by the Postgres stores.

use crate::error::StoreError;
use sqlx::postgres::PgTransaction;
use sqlx::PgPool;

pub async fn begin_transaction(db: &PgPool) -> Result<PgTransaction<'_>, StoreError> {
    db.begin().await.map_err(StoreError::from)
}

pub async fn commit_transaction(tx: PgTransaction<'_>) -> Result<(), StoreError> {
    tx.commit().await.map_err(StoreError::from)
}

/// Serialises session bookkeeping for one account until the transaction ends.
pub async fn lock_account(
    tx: &mut PgTransaction<'_>,
    account_key: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(account_key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

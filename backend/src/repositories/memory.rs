//! In-process stores with the same semantics as the Postgres ones. Every
//! operation runs under a single mutex, so each call is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::SessionLimitPolicy;
use crate::error::StoreError;
use crate::models::account::AccountRef;
use crate::models::login_attempt::{LoginAttempt, NewLoginAttempt};
use crate::models::session::{NewSession, SessionRecord};
use crate::repositories::login_attempt::AttemptLedger;
use crate::repositories::session::{
    eviction_count, CreateOutcome, LimitOutcome, RotationOutcome, SessionLimit, SessionStore,
};
use crate::types::FamilyId;

#[derive(Debug, Default)]
struct SessionState {
    records: Vec<SessionRecord>,
    next_id: i64,
}

impl SessionState {
    fn insert(&mut self, session: NewSession) -> Result<SessionRecord, StoreError> {
        if self.records.iter().any(|r| r.token == session.token) {
            return Err(StoreError::Corrupt("duplicate refresh token".into()));
        }
        if self
            .records
            .iter()
            .any(|r| r.family_id == session.family_id && r.generation == session.generation)
        {
            return Err(StoreError::Corrupt(format!(
                "duplicate generation {} in family {}",
                session.generation, session.family_id
            )));
        }
        if self
            .records
            .iter()
            .any(|r| r.family_id == session.family_id && !r.used && !r.revoked)
        {
            return Err(StoreError::Corrupt(format!(
                "family {} already has a live record",
                session.family_id
            )));
        }

        self.next_id += 1;
        let record = session.into_record(self.next_id);
        self.records.push(record.clone());
        Ok(record)
    }

    fn live_for(&self, account: AccountRef, now: DateTime<Utc>) -> Vec<&SessionRecord> {
        self.records
            .iter()
            .filter(|r| r.account == account && r.is_live(now))
            .collect()
    }

    fn revoke_where<F>(&mut self, predicate: F) -> u64
    where
        F: Fn(&SessionRecord) -> bool,
    {
        let mut revoked = 0;
        for record in self.records.iter_mut().filter(|r| !r.revoked) {
            if predicate(record) {
                record.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }

    fn enforce_limit(
        &mut self,
        account: AccountRef,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> LimitOutcome {
        let mut live = self.live_for(account, now);
        let max = limit.max as usize;
        if live.len() < max {
            return LimitOutcome::Within;
        }
        if limit.policy == SessionLimitPolicy::Reject {
            return LimitOutcome::Exceeded;
        }

        live.sort_by_key(|r| (r.created_at, r.id));
        let evict: Vec<FamilyId> = live
            .iter()
            .take(eviction_count(live.len(), max))
            .map(|r| r.family_id)
            .collect();
        self.revoke_where(|r| evict.contains(&r.family_id));
        LimitOutcome::Evicted(evict)
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<SessionState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, in insertion order.
    pub async fn snapshot(&self) -> Vec<SessionRecord> {
        self.state.lock().await.records.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<SessionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.iter().find(|r| r.token == token).cloned())
    }

    async fn create(
        &self,
        session: NewSession,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let evicted = match state.enforce_limit(session.account, limit, now) {
            LimitOutcome::Exceeded => return Ok(CreateOutcome::LimitReached),
            LimitOutcome::Within => Vec::new(),
            LimitOutcome::Evicted(families) => families,
        };
        let record = state.insert(session)?;
        Ok(CreateOutcome::Created { record, evicted })
    }

    async fn enforce_limit(
        &self,
        account: AccountRef,
        limit: SessionLimit,
        now: DateTime<Utc>,
    ) -> Result<LimitOutcome, StoreError> {
        Ok(self.state.lock().await.enforce_limit(account, limit, now))
    }

    async fn rotate(
        &self,
        predecessor_id: i64,
        used_at: DateTime<Utc>,
        successor: NewSession,
    ) -> Result<RotationOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(index) = state
            .records
            .iter()
            .position(|r| r.id == predecessor_id && !r.used && !r.revoked)
        else {
            return Ok(RotationOutcome::Conflict);
        };

        let successor_token = successor.token.clone();
        {
            let predecessor = &mut state.records[index];
            predecessor.used = true;
            predecessor.used_at = Some(used_at);
        }
        match state.insert(successor) {
            Ok(record) => {
                state.records[index].replaced_by_token = Some(successor_token);
                Ok(RotationOutcome::Rotated(record))
            }
            Err(err) => {
                let predecessor = &mut state.records[index];
                predecessor.used = false;
                predecessor.used_at = None;
                Err(err)
            }
        }
    }

    async fn revoke_family(&self, family_id: FamilyId) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.revoke_where(|r| r.family_id == family_id))
    }

    async fn revoke_all(&self, account: AccountRef) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.revoke_where(|r| r.account == account))
    }

    async fn revoke_all_except(
        &self,
        account: AccountRef,
        keep: FamilyId,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.revoke_where(|r| r.account == account && r.family_id != keep))
    }

    async fn find_live_sessions(
        &self,
        account: AccountRef,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut live: Vec<SessionRecord> =
            state.live_for(account, now).into_iter().cloned().collect();
        live.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(live)
    }

    async fn count_live_sessions(
        &self,
        account: AccountRef,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.live_for(account, now).len() as u64)
    }

    async fn family_records(&self, family_id: FamilyId) -> Result<Vec<SessionRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<SessionRecord> = state
            .records
            .iter()
            .filter(|r| r.family_id == family_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.generation);
        Ok(records)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|r| !r.is_expired(now));
        Ok((before - state.records.len()) as u64)
    }
}

#[derive(Debug, Default)]
struct AttemptState {
    attempts: Vec<LoginAttempt>,
    next_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryAttemptLedger {
    state: Mutex<AttemptState>,
}

impl MemoryAttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<LoginAttempt> {
        self.state.lock().await.attempts.clone()
    }

    async fn failures_since<F>(&self, since: DateTime<Utc>, matches: F) -> Vec<DateTime<Utc>>
    where
        F: Fn(&LoginAttempt) -> bool,
    {
        let state = self.state.lock().await;
        state
            .attempts
            .iter()
            .filter(|a| !a.successful && a.created_at > since && matches(a))
            .map(|a| a.created_at)
            .collect()
    }
}

#[async_trait]
impl AttemptLedger for MemoryAttemptLedger {
    async fn record(&self, attempt: NewLoginAttempt) -> Result<LoginAttempt, StoreError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let stored = attempt.into_attempt(state.next_id);
        state.attempts.push(stored.clone());
        Ok(stored)
    }

    async fn count_failed_by_identifier(
        &self,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let failures = self.failures_since(since, |a| a.identifier == identifier).await;
        Ok(failures.len() as u64)
    }

    async fn count_failed_by_ip(&self, ip: &str, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let failures = self.failures_since(since, |a| a.ip_address == ip).await;
        Ok(failures.len() as u64)
    }

    async fn last_failed_by_identifier(
        &self,
        identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let failures = self.failures_since(since, |a| a.identifier == identifier).await;
        Ok(failures.into_iter().max())
    }

    async fn last_failed_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let failures = self.failures_since(since, |a| a.ip_address == ip).await;
        Ok(failures.into_iter().max())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.attempts.len();
        state.attempts.retain(|a| a.created_at >= cutoff);
        Ok((before - state.attempts.len()) as u64)
    }
}

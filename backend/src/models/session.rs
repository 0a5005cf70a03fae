//! Refresh-token session records and the views derived from them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::account::{AccountRef, AccountType};
use crate::types::FamilyId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Client context captured from the request that created or rotated a session.
pub struct SessionInfo {
    pub ip_address: String,
    pub user_agent: Option<String>,
}

impl SessionInfo {
    pub fn new(ip_address: impl Into<String>, user_agent: Option<&str>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent
                .map(str::trim)
                .filter(|agent| !agent.is_empty())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Persisted refresh-token record.
///
/// Records are only ever mutated to mark them used (with the forward pointer
/// to their successor) or revoked; neither flag is ever cleared.
pub struct SessionRecord {
    pub id: i64,
    #[serde(skip_serializing)]
    pub token: String,
    pub family_id: FamilyId,
    /// Position in the rotation chain, starting at 1.
    pub generation: i32,
    pub account: AccountRef,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    #[serde(skip_serializing)]
    pub replaced_by_token: Option<String>,
}

impl SessionRecord {
    pub fn account_type(&self) -> AccountType {
        self.account.account_type()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Neither used, revoked nor expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.revoked && !self.is_expired(now)
    }

    /// Lifetime the record was issued with; successors inherit it so a
    /// short session stays short across rotations.
    pub fn lifetime(&self) -> Duration {
        self.expires_at - self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A record about to be inserted, either the first of a family or the
/// successor produced by a rotation.
pub struct NewSession {
    pub token: String,
    pub family_id: FamilyId,
    pub generation: i32,
    pub account: AccountRef,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewSession {
    pub(crate) fn into_record(self, id: i64) -> SessionRecord {
        SessionRecord {
            id,
            token: self.token,
            family_id: self.family_id,
            generation: self.generation,
            account: self.account,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_at: self.created_at,
            expires_at: self.expires_at,
            used: false,
            used_at: None,
            revoked: false,
            replaced_by_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// One row of a "manage devices" listing.
pub struct SessionSummary {
    pub family_id: FamilyId,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_current: bool,
}

impl SessionSummary {
    pub fn from_record(record: &SessionRecord, current_family: Option<FamilyId>) -> Self {
        Self {
            family_id: record.family_id,
            ip_address: record.ip_address.clone(),
            user_agent: record.user_agent.clone(),
            created_at: record.created_at,
            is_current: current_family == Some(record.family_id),
        }
    }
}

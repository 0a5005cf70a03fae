//! Account kinds and the polymorphic account reference carried by sessions and
//! login attempts.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::types::{ModeratorId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The two kinds of account that can hold a session.
pub enum AccountType {
    /// End user of the platform.
    User,
    /// Staff account with moderation privileges.
    Moderator,
}

impl AccountType {
    /// Returns the canonical upper-case representation stored in the database
    /// and carried in token claims.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::User => "USER",
            AccountType::Moderator => "MODERATOR",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown account type: {0}")]
pub struct UnknownAccountType(pub String);

impl FromStr for AccountType {
    type Err = UnknownAccountType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" | "user" | "User" => Ok(AccountType::User),
            "MODERATOR" | "moderator" | "Moderator" => Ok(AccountType::Moderator),
            other => Err(UnknownAccountType(other.to_string())),
        }
    }
}

impl Serialize for AccountType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AccountType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::unknown_variant(&s, &["USER", "MODERATOR"]))
    }
}

/// Reference to exactly one account of either kind.
///
/// Sessions belong to a user or a moderator, never both; the tag makes that
/// structural instead of a pair of nullable keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountRef {
    User(UserId),
    Moderator(ModeratorId),
}

impl AccountRef {
    pub fn account_type(&self) -> AccountType {
        match self {
            AccountRef::User(_) => AccountType::User,
            AccountRef::Moderator(_) => AccountType::Moderator,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            AccountRef::User(id) => Some(*id),
            AccountRef::Moderator(_) => None,
        }
    }

    pub fn moderator_id(&self) -> Option<ModeratorId> {
        match self {
            AccountRef::Moderator(id) => Some(*id),
            AccountRef::User(_) => None,
        }
    }

    /// Rebuilds a reference from the `(account_type, user_id, moderator_id)`
    /// column triple. Exactly the key matching the tag must be present.
    pub fn from_columns(
        account_type: AccountType,
        user_id: Option<i64>,
        moderator_id: Option<i64>,
    ) -> Result<Self, String> {
        match (account_type, user_id, moderator_id) {
            (AccountType::User, Some(id), None) => Ok(AccountRef::User(UserId::new(id))),
            (AccountType::Moderator, None, Some(id)) => {
                Ok(AccountRef::Moderator(ModeratorId::new(id)))
            }
            (kind, user_id, moderator_id) => Err(format!(
                "account reference mismatch: type={kind} user_id={user_id:?} moderator_id={moderator_id:?}"
            )),
        }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRef::User(id) => write!(f, "user:{id}"),
            AccountRef::Moderator(id) => write!(f, "moderator:{id}"),
        }
    }
}

impl From<UserId> for AccountRef {
    fn from(id: UserId) -> Self {
        AccountRef::User(id)
    }
}

impl From<ModeratorId> for AccountRef {
    fn from(id: ModeratorId) -> Self {
        AccountRef::Moderator(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Administrative status reported by the account store.
pub enum AccountStatus {
    Active,
    /// Deactivated by the owner or an administrator.
    Disabled,
    /// Locked by moderation; distinct from the computed brute-force lockout.
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An account whose credentials were verified by the account store.
pub struct AuthenticatedAccount {
    pub account: AccountRef,
    /// Public identifier exposed in tokens.
    pub uuid: Uuid,
    /// Login handle, used as the token subject.
    pub username: String,
    pub roles: Vec<String>,
    pub status: AccountStatus,
}

impl AuthenticatedAccount {
    pub fn account_type(&self) -> AccountType {
        self.account.account_type()
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::models::account::AccountType;
use crate::types::FamilyId;
use crate::utils::time::Clock;

/// HMAC-SHA256 needs a key at least as long as its output.
pub const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "ACCESS",
            TokenType::Refresh => "REFRESH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String, // login handle
    pub uuid: Uuid,  // account public id
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub token_type: TokenType,
    pub family_id: FamilyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i32>, // refresh only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>, // access only
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.iat, 0).single()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Invalid token format")]
    Malformed,
    #[error("Unsupported token")]
    Unsupported,
    #[error("Token is empty")]
    Empty,
    #[error("Unexpected token type: expected {expected:?}, got {actual:?}")]
    WrongTokenType {
        expected: TokenType,
        actual: TokenType,
    },
    #[error("JWT secret must be at least 256 bits, got {bits}")]
    KeyTooShort { bits: usize },
    #[error("Failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature => TokenError::BadSignature,
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::ImmatureSignature => TokenError::Unsupported,
            _ => TokenError::Malformed,
        }
    }
}

/// Signs and verifies the bearer tokens handed to clients.
///
/// Stateless: every claim is recovered by decoding a verified payload.
/// `iat` and `exp` are stamped and checked against the injected clock.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Fails fast when the signing key is shorter than 256 bits.
    pub fn new(config: &TokenConfig, clock: Arc<dyn Clock>) -> Result<Self, TokenError> {
        let secret = config.secret.as_bytes();
        if secret.len() < MIN_SECRET_BYTES {
            return Err(TokenError::KeyTooShort {
                bits: secret.len() * 8,
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(),
            clock,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access(
        &self,
        account_uuid: Uuid,
        account_type: AccountType,
        subject: &str,
        roles: &[String],
        family_id: FamilyId,
    ) -> Result<String, TokenError> {
        let claims = self.claims(
            account_uuid,
            account_type,
            subject,
            TokenType::Access,
            family_id,
            self.access_ttl,
        );
        self.sign(&Claims {
            roles: Some(roles.to_vec()),
            ..claims
        })
    }

    pub fn issue_refresh(
        &self,
        account_uuid: Uuid,
        account_type: AccountType,
        subject: &str,
        family_id: FamilyId,
        generation: i32,
    ) -> Result<String, TokenError> {
        self.issue_refresh_with_ttl(
            account_uuid,
            account_type,
            subject,
            family_id,
            generation,
            self.refresh_ttl,
        )
    }

    /// Refresh token for a session whose lifetime differs from the default
    /// refresh lifetime, such as one created without remember-me.
    pub fn issue_refresh_with_ttl(
        &self,
        account_uuid: Uuid,
        account_type: AccountType,
        subject: &str,
        family_id: FamilyId,
        generation: i32,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let claims = self.claims(
            account_uuid,
            account_type,
            subject,
            TokenType::Refresh,
            family_id,
            ttl,
        );
        self.sign(&Claims {
            generation: Some(generation),
            ..claims
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Empty);
        }
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.exp < self.clock.now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(data.claims)
    }

    pub fn require_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.require(token, TokenType::Access)
    }

    pub fn require_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        self.require(token, TokenType::Refresh)
    }

    fn require(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.token_type != expected {
            return Err(TokenError::WrongTokenType {
                expected,
                actual: claims.token_type,
            });
        }
        Ok(claims)
    }

    fn claims(
        &self,
        account_uuid: Uuid,
        account_type: AccountType,
        subject: &str,
        token_type: TokenType,
        family_id: FamilyId,
        ttl: Duration,
    ) -> Claims {
        let now = self.clock.now();
        Claims {
            sub: subject.to_string(),
            uuid: account_uuid,
            account_type,
            token_type,
            family_id,
            generation: None,
            roles: None,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(TokenError::Signing)
    }
}

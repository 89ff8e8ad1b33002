use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mds_core::UserId;

use crate::Permission;

/// JWT claims model (transport-agnostic).
///
/// This is the minimal set of claims the services expect once a token has been
/// decoded/verified. `iat` / `exp` are seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject: the authenticated user.
    pub sub: UserId,

    #[serde(default)]
    pub username: String,

    /// Permissions granted to the user.
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// Admins implicitly hold every permission.
    #[serde(default)]
    pub is_admin: bool,

    /// Issued-at timestamp.
    pub iat: i64,

    /// Expiration timestamp.
    pub exp: i64,
}

impl JwtClaims {
    pub fn issued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.iat, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Deterministically validate JWT claims.
///
/// Note: this validates the *claims* only. Signature verification happens in
/// [`crate::Hs256TokenValidator`].
pub fn validate_claims(claims: &JwtClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at() {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at() {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

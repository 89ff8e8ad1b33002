use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use mds_auth::{JwtClaims, Permission};
use mds_core::UserId;

/// Builder for signed test tokens.
#[derive(Debug, Clone)]
pub struct TokenBuilder {
    claims: JwtClaims,
}

impl TokenBuilder {
    /// Token for a fresh user, valid for ten minutes.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            claims: JwtClaims {
                sub: UserId::new(),
                username: "test-user".to_string(),
                permissions: Vec::new(),
                is_admin: false,
                iat: (now - Duration::seconds(5)).timestamp(),
                exp: (now + Duration::minutes(10)).timestamp(),
            },
        }
    }

    pub fn user(mut self, id: UserId) -> Self {
        self.claims.sub = id;
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.claims.permissions.push(permission);
        self
    }

    pub fn admin(mut self) -> Self {
        self.claims.is_admin = true;
        self
    }

    /// Expire `ttl` from now.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.claims.exp = (Utc::now() + ttl).timestamp();
        self
    }

    pub fn claims(&self) -> &JwtClaims {
        &self.claims
    }

    pub fn sign(&self, secret: &str) -> String {
        mint_token(secret, &self.claims)
    }
}

impl Default for TokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign `claims` with HS256.
pub fn mint_token(secret: &str, claims: &JwtClaims) -> String {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("HS256 signing with an in-memory key does not fail")
}

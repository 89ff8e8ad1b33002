use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use mds_core::UserId;

use crate::claims::{validate_claims, JwtClaims, TokenValidationError};
use crate::permissions::{Permission, WILDCARD};

/// An authenticated user as seen by authorization checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
    pub permissions: HashSet<Permission>,
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    pub fn from_claims(claims: &JwtClaims) -> Self {
        let mut permissions: HashSet<Permission> = claims.permissions.iter().cloned().collect();
        if claims.is_admin {
            permissions.insert(WILDCARD);
        }
        Self {
            user_id: claims.sub,
            username: claims.username.clone(),
            permissions,
            expires_at: claims.expires_at(),
        }
    }

    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(&WILDCARD) || self.permissions.contains(permission)
    }
}

/// Turns a raw bearer token into a principal.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Principal, TokenValidationError>;
}

/// HS256 JWT validator sharing one secret with the token issuer.
pub struct Hs256TokenValidator {
    key: DecodingKey,
}

impl Hs256TokenValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
        }
    }
}

impl TokenValidator for Hs256TokenValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Principal, TokenValidationError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time window is checked by `validate_claims` against the caller's clock.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &validation)
            .map_err(|e| TokenValidationError::Malformed(e.to_string()))?;
        validate_claims(&data.claims, now)?;
        Ok(Principal::from_claims(&data.claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::MANAGE_INTEL_DELIVERY;
    use chrono::Duration;
    use jsonwebtoken::{EncodingKey, Header};

    fn mint(secret: &str, claims: &JwtClaims) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(permissions: Vec<Permission>, is_admin: bool) -> JwtClaims {
        let now = Utc::now();
        JwtClaims {
            sub: UserId::new(),
            username: "dispatcher".to_string(),
            permissions,
            is_admin,
            iat: (now - Duration::minutes(1)).timestamp(),
            exp: (now + Duration::minutes(10)).timestamp(),
        }
    }

    #[test]
    fn validates_signed_token() {
        let c = claims(vec![MANAGE_INTEL_DELIVERY], false);
        let token = mint("secret", &c);
        let principal = Hs256TokenValidator::new("secret")
            .validate(&token, Utc::now())
            .unwrap();
        assert_eq!(principal.user_id, c.sub);
        assert!(principal.has(&MANAGE_INTEL_DELIVERY));
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = mint("secret", &claims(vec![], false));
        let err = Hs256TokenValidator::new("other")
            .validate(&token, Utc::now())
            .unwrap_err();
        assert!(matches!(err, TokenValidationError::Malformed(_)));
    }

    #[test]
    fn admin_holds_every_permission() {
        let principal = Principal::from_claims(&claims(vec![], true));
        assert!(principal.has(&MANAGE_INTEL_DELIVERY));
        assert!(principal.has(&Permission::new("anything")));
    }
}

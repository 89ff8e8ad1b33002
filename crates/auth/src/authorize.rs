use thiserror::Error;

use mds_core::Error;

use crate::{Permission, Principal};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

impl From<AuthzError> for Error {
    fn from(value: AuthzError) -> Self {
        Error::forbidden(value.to_string())
    }
}

/// Authorize a principal for one permission.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.has(required) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

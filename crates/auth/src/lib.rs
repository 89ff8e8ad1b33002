//! `mds-auth` — authentication/authorization boundary of the services.
//!
//! Tokens are issued elsewhere; this crate only validates them and answers
//! permission questions. It is decoupled from HTTP and storage.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod principal;

pub use authorize::{authorize, AuthzError};
pub use claims::{validate_claims, JwtClaims, TokenValidationError};
pub use permissions::Permission;
pub use principal::{Hs256TokenValidator, Principal, TokenValidator};

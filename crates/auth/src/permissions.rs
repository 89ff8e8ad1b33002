use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are modeled as opaque strings (e.g. "manage-intel-delivery").
/// A special wildcard permission `"*"` is granted to admins and allows everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grants everything.
pub const WILDCARD: Permission = Permission::from_static("*");

/// Required to watch and dispatch open intel deliveries.
pub const MANAGE_INTEL_DELIVERY: Permission = Permission::from_static("manage-intel-delivery");

/// Required to mutate groups.
pub const MANAGE_GROUPS: Permission = Permission::from_static("manage-groups");

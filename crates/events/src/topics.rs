//! Topic names of the platform bus.

pub const OPERATIONS: &str = "operations";
pub const USERS: &str = "users";
pub const INTEL: &str = "intel";
pub const INTEL_DELIVERIES: &str = "intel-deliveries";
pub const ADDRESS_BOOK: &str = "address-book";
pub const GROUPS: &str = "groups";

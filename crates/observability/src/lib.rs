//! Tracing/logging setup shared by the service binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize compact, human-readable output for tests and local runs.
pub fn init_for_tests() {
    tracing::init_pretty();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

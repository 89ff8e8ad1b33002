//! Test support shared by the service crates.
//!
//! - `checkpoint`: ordered checkpoint log to assert on concurrent interleavings
//! - `tokens`: HS256 tokens for exercising authenticated endpoints

pub mod checkpoint;
pub mod tokens;

pub use checkpoint::CheckpointRecorder;
pub use tokens::{mint_token, TokenBuilder};

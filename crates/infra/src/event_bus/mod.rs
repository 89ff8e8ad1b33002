//! Infrastructure-backed implementations of the bus contracts in `mds-events`.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, RedisStreamsConsumer};

//! Infrastructure layer: transactions, outbox, bus consumption, search ingestion.
//!
//! - `db`: the unit-of-work discipline and the Postgres / in-memory databases
//! - `outbox`: transactional event writer and its drainer
//! - `consumer`: at-least-once bus consumer loop
//! - `search`: safe search-index ingestion (action queue, drainer, clients)
//! - `event_bus`: Redis Streams implementation of the bus contracts

pub mod backoff;
pub mod consumer;
pub mod db;
pub mod event_bus;
pub mod outbox;
pub mod search;
pub mod worker;

pub use consumer::{ConsumerConfig, ConsumerLoop, MessageHandler};
pub use db::{run_in_tx, MemDatabase, MemTx, PgDatabase, PgTx, Transactional};
pub use worker::WorkerHandle;

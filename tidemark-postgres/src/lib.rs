//! PostgreSQL-backed event log.
//!
//! This crate provides [`Store`], an implementation of
//! [`tidemark_core::store::EventLog`] over two tables: `tm_streams`, whose
//! per-stream row carries the last event index and doubles as the
//! optimistic-concurrency lock, and `tm_events`, holding the encoded events
//! themselves.
//!
//! Reads may be routed to a follower pool via
//! [`Store::with_read_replica`]; writes and leader-required reads always use
//! the write pool.

mod error;
mod store;

pub use error::Error;
pub use store::{RetryPolicy, Store};

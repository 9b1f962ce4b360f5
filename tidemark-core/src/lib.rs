//! Core contracts and decision loop for the Tidemark event-sourcing library.
//!
//! This crate provides the storage-agnostic pieces:
//!
//! - [`token`] - Stream position handles (`StreamToken`)
//! - [`codec`] - Event encoding boundary (`EventCodec`, `codec::Json`)
//! - [`store`] - Append-log contract (`EventLog`) plus an in-memory reference
//!   log for tests and examples
//! - [`cache`] - Keyed `(token, state)` caching with supersede arbitration
//! - [`category`] - Per-stream-category policy: codec, fold, access strategy
//! - [`decider`] - The public `transact`/`query` surface and its retry loop
//! - [`compaction`] - Scheduling of in-stream rolling snapshots
//! - [`metrics`] - Structured store instrumentation observers
//!
//! Most users should depend on the `tidemark` crate, which re-exports these
//! types together with the Postgres-backed log.

pub mod cache;
pub mod category;
pub mod codec;
pub mod compaction;
pub mod decider;
pub mod metrics;
pub mod store;
pub mod token;

use thiserror::Error;

/// Configuration rejected at construction time.
///
/// Raised before any I/O begins, e.g. for a zero sync-attempt budget or for
/// combining [`category::AccessStrategy::LatestKnownEvent`] with a cache.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {reason}")]
pub struct ConfigError {
    reason: String,
}

impl ConfigError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Human-readable description of the rejected configuration.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

//! Append-log abstraction.
//!
//! This module describes the per-backend contract ([`EventLog`]), the wire
//! forms crossing it ([`PendingEvent`], [`StoredEvent`]), sync outcomes, the
//! shared error taxonomy, and pagination policy. A reference in-memory
//! implementation lives in [`memory`].

use std::future::Future;

pub use nonempty::NonEmpty;
use thiserror::Error;
use uuid::Uuid;

use crate::token::StreamToken;

pub mod memory;

/// Raw event ready to be appended to a stream.
///
/// This is the boundary between a category's codec and the log. The id is
/// assigned at encode time; correlation and causation travel inside the
/// opaque metadata bytes when the application needs them.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    pub id: Uuid,
    pub kind: String,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

impl PendingEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            data,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Event materialised from the log, with its per-stream index.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub id: Uuid,
    pub index: i64,
    pub kind: String,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

/// Predicate matching event kinds that act as compaction snapshots.
pub type CompactionPredicate = dyn Fn(&str) -> bool + Send + Sync;

/// Outcome of a version-conditional append.
#[derive(Clone, Debug)]
pub enum SyncResult {
    /// The batch was appended; the token reflects the new stream head.
    Written(StreamToken),
    /// The version precondition failed. Carries the backend's observed
    /// token when it was cheap to produce.
    ConflictUnknown(Option<StreamToken>),
}

/// Failures surfaced by log operations.
///
/// Transient transport problems are retried inside the adapter; what reaches
/// this enum is terminal for the operation that produced it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream has been hard-deleted; reads and writes cannot proceed.
    #[error("stream {stream} has been deleted")]
    StreamDeleted { stream: String },
    /// A scan needed more pages than the configured cap allows.
    #[error("reading stream {stream} exceeded the {max_batches}-batch page limit")]
    BatchLimitExceeded { stream: String, max_batches: usize },
    /// Transport failure that outlived the adapter's retry budget.
    #[error("transport failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl StoreError {
    /// Wrap an adapter-native error as an opaque transport failure.
    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(source))
    }
}

/// Pagination policy for scans.
///
/// `batch_size` is also the compaction window: rolling-snapshot categories
/// keep an origin event within the last `batch_size` events of the stream.
#[derive(Clone, Copy, Debug)]
pub struct BatchingPolicy {
    /// Events fetched per page.
    pub batch_size: usize,
    /// Scans needing more pages than this fail with
    /// [`StoreError::BatchLimitExceeded`]; `None` leaves scans unbounded.
    pub max_batches: Option<usize>,
}

impl BatchingPolicy {
    #[must_use]
    pub const fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            max_batches: None,
        }
    }

    #[must_use]
    pub const fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    /// Batch size as the `i64` the token arithmetic works in.
    #[must_use]
    pub const fn window(&self) -> i64 {
        self.batch_size as i64
    }
}

impl Default for BatchingPolicy {
    fn default() -> Self {
        Self::new(500)
    }
}

/// Result of a raw forward scan.
pub type LoadResult = Result<(StreamToken, Vec<StoredEvent>), StoreError>;

/// Result of a backward scan that decodes while it reads.
pub type DecodedLoadResult<E> = Result<(StreamToken, Vec<(StoredEvent, Option<E>)>), StoreError>;

/// Contract a backend adapter implements for one kind of store.
///
/// Implementations must be thread-safe and own their connection handling;
/// every operation is cancellable by dropping the returned future.
pub trait EventLog: Send + Sync {
    /// The pagination policy this log was configured with.
    fn batching(&self) -> &BatchingPolicy;

    /// Forward scan from `from_version`, returning the latest-known version.
    ///
    /// When `is_compaction` is supplied the returned token records the last
    /// matching event of the scan as the stream's origin and carries append
    /// headroom; otherwise the token tracks the version alone.
    fn load_batched<'a>(
        &'a self,
        stream: &'a str,
        from_version: i64,
        is_compaction: Option<&'a CompactionPredicate>,
    ) -> impl Future<Output = LoadResult> + Send + 'a;

    /// Backward scan in pages until the first decoded event for which
    /// `is_origin` holds (inclusive), or the stream start.
    ///
    /// Events come back in forward order, each paired with its decoded form
    /// where `try_decode` recognised it. The scan does not stop at
    /// undecodable events, so the origin is the newest *decodable* match.
    fn load_backwards_until_origin<'a, E>(
        &'a self,
        stream: &'a str,
        try_decode: &'a (dyn Fn(&StoredEvent) -> Option<E> + Send + Sync),
        is_origin: &'a (dyn Fn(&E) -> bool + Send + Sync),
    ) -> impl Future<Output = DecodedLoadResult<E>> + Send + 'a
    where
        E: Send + 'a;

    /// Forward scan of the tail starting at `token.stream_version() + 1`.
    ///
    /// `require_leader` routes the read through the write connection on
    /// stores that prefer a follower for plain reads.
    fn load_from_token<'a>(
        &'a self,
        require_leader: bool,
        stream: &'a str,
        token: &'a StreamToken,
        is_compaction: Option<&'a CompactionPredicate>,
    ) -> impl Future<Output = LoadResult> + Send + 'a;

    /// Append `events` iff the stream is still at `expected`.
    ///
    /// Token derivation on [`SyncResult::Written`] follows
    /// [`StreamToken::after_append`].
    fn try_sync<'a>(
        &'a self,
        stream: &'a str,
        expected: &'a StreamToken,
        events: NonEmpty<PendingEvent>,
        is_compaction: Option<&'a CompactionPredicate>,
    ) -> impl Future<Output = Result<SyncResult, StoreError>> + Send + 'a;
}

/// Category-prefixed composite stream names (`Category-id1_id2`).
///
/// The core treats stream names as opaque; this helper only standardises the
/// convention for applications that want it.
#[derive(Clone, Copy, Debug)]
pub struct StreamName;

impl StreamName {
    /// Render `category` and `ids` as `Category-id1_id2`.
    #[must_use]
    pub fn compose(category: &str, ids: &[&str]) -> String {
        format!("{category}-{}", ids.join("_"))
    }
}

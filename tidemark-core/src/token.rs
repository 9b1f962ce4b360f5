//! Stream position tokens.
//!
//! A [`StreamToken`] is the opaque handle that travels between loads and
//! syncs. It carries the backend-native stream version, the position of the
//! most recent origin (snapshot) event where one is known, and the remaining
//! append headroom before another rolling snapshot is warranted.
//!
//! Application code only ever observes [`StreamToken::version`] and
//! [`StreamToken::stream_bytes`] (plus memento round-trips); everything else
//! is bookkeeping between a [`crate::category::Category`] and its
//! [`crate::store::EventLog`].

use crate::store::CompactionPredicate;

/// Opaque per-stream position handle.
///
/// Invariant: `version() == stream_version() + 1`, where the backend-native
/// `stream_version` is `-1` for an empty stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamToken {
    stream_version: i64,
    snapshot_event_number: Option<i64>,
    batch_capacity_limit: Option<i64>,
    stream_bytes: i64,
}

/// Remaining appends before another snapshot is due.
///
/// With a known snapshot the window spans the snapshot event itself through
/// the head of the stream; without one the whole stream plus the implicit
/// empty-stream slot counts against the batch.
fn capacity_limit(
    batch_size: i64,
    unstored_pending: i64,
    stream_version: i64,
    snapshot_event_number: Option<i64>,
) -> i64 {
    let occupied = match snapshot_event_number {
        Some(snapshot) => stream_version - snapshot + 1,
        None => stream_version + 2,
    };
    (batch_size - unstored_pending - occupied).max(0)
}

impl StreamToken {
    /// Token for a stream that holds no events.
    ///
    /// `compaction_batch_size` should be supplied when the caller intends to
    /// use a compaction access strategy, so the token carries append headroom
    /// from the start.
    #[must_use]
    pub fn for_empty_stream(compaction_batch_size: Option<i64>) -> Self {
        Self {
            stream_version: -1,
            snapshot_event_number: None,
            batch_capacity_limit: compaction_batch_size
                .map(|batch_size| capacity_limit(batch_size, 0, -1, None)),
            stream_bytes: -1,
        }
    }

    /// Token for a plain forward load with no snapshot bookkeeping.
    ///
    /// Intended for store implementations.
    #[must_use]
    pub fn of_uncompacted(stream_version: i64) -> Self {
        Self {
            stream_version,
            snapshot_event_number: None,
            batch_capacity_limit: None,
            stream_bytes: -1,
        }
    }

    /// Token for a load that tracked snapshot positions.
    ///
    /// `snapshot_event_number` is the event number of the most recent origin
    /// event observed by the scan, or `None` when the scan reached the stream
    /// start without finding one. Intended for store implementations.
    #[must_use]
    pub fn of_snapshot_window(
        stream_version: i64,
        snapshot_event_number: Option<i64>,
        batch_size: i64,
        unstored_pending: i64,
    ) -> Self {
        Self {
            stream_version,
            snapshot_event_number,
            batch_capacity_limit: Some(capacity_limit(
                batch_size,
                unstored_pending,
                stream_version,
                snapshot_event_number,
            )),
            stream_bytes: -1,
        }
    }

    /// Token for a batch just appended after `expected`.
    ///
    /// When `is_compaction` is supplied the just-written kinds are searched
    /// backwards for a snapshot; on a match the new origin is the matched
    /// event's number, otherwise the previous origin carries over and the
    /// remaining capacity shrinks by the batch length. Intended for store
    /// implementations.
    #[must_use]
    pub fn after_append(
        expected: &Self,
        written_kinds: &[&str],
        is_compaction: Option<&CompactionPredicate>,
        batch_size: i64,
    ) -> Self {
        let stream_version = expected.stream_version + written_kinds.len() as i64;
        let (snapshot_event_number, track_capacity) = match is_compaction {
            Some(predicate) => {
                let matched = written_kinds
                    .iter()
                    .rposition(|kind| predicate(kind))
                    .map(|index| expected.stream_version + 1 + index as i64);
                (
                    matched.or(expected.snapshot_event_number),
                    true,
                )
            }
            None => (
                expected.snapshot_event_number,
                expected.batch_capacity_limit.is_some(),
            ),
        };
        Self {
            stream_version,
            snapshot_event_number,
            batch_capacity_limit: track_capacity.then(|| {
                capacity_limit(batch_size, 0, stream_version, snapshot_event_number)
            }),
            stream_bytes: -1,
        }
    }

    /// Attach a measured stream size in bytes. Negative values mean
    /// unmeasured.
    #[must_use]
    pub fn with_stream_bytes(mut self, stream_bytes: i64) -> Self {
        self.stream_bytes = stream_bytes;
        self
    }

    /// Count of persisted events; `0` for an empty stream.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.stream_version + 1
    }

    /// Backend-native stream version; `-1` for an empty stream.
    ///
    /// Intended for store implementations translating to a wire protocol's
    /// expected-version field.
    #[must_use]
    pub fn stream_version(&self) -> i64 {
        self.stream_version
    }

    /// Event number of the most recent known origin event, if any.
    ///
    /// Intended for store implementations.
    #[must_use]
    pub fn snapshot_event_number(&self) -> Option<i64> {
        self.snapshot_event_number
    }

    /// Remaining events that can be appended before another snapshot is due.
    ///
    /// Present only when the stream is read under a compaction access
    /// strategy.
    #[must_use]
    pub fn batch_capacity_limit(&self) -> Option<i64> {
        self.batch_capacity_limit
    }

    /// Measured stream size in bytes, when the backend reported one.
    #[must_use]
    pub fn stream_bytes(&self) -> Option<i64> {
        (self.stream_bytes >= 0).then_some(self.stream_bytes)
    }

    /// Whether this token reflects a strictly later stream state than
    /// `other`. Used to arbitrate concurrent cache updates.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        self.stream_version > other.stream_version
    }
}

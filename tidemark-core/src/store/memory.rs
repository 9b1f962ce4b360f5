//! In-memory event log for tests and examples.
//!
//! [`MemoryLog`] is a thread-safe reference implementation of
//! [`EventLog`](super::EventLog). Pages are synthetic (the whole stream lives
//! in one map) but pagination accounting, token derivation, and metrics
//! behave like a real adapter so the decision loop can be exercised without
//! I/O.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Instant,
};

use nonempty::NonEmpty;

use crate::{
    metrics::{BatchMetric, Direction, SliceMetric, StoreObserver, TracingObserver, WriteMetric},
    store::{
        BatchingPolicy, CompactionPredicate, DecodedLoadResult, EventLog, LoadResult, PendingEvent,
        StoreError, StoredEvent, SyncResult,
    },
    token::StreamToken,
};

/// In-memory append log keyed by stream name.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<RwLock<Inner>>,
    batching: BatchingPolicy,
    observer: Arc<dyn StoreObserver>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<StoredEvent>>,
    deleted: HashSet<String>,
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_batching(BatchingPolicy::default())
    }

    #[must_use]
    pub fn with_batching(batching: BatchingPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            batching,
            observer: Arc::new(TracingObserver),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Hard-delete a stream. Subsequent loads and syncs fail with
    /// [`StoreError::StreamDeleted`].
    pub fn delete_stream(&self, stream: &str) {
        let mut inner = self.inner.write().expect("in-memory log lock poisoned");
        inner.streams.remove(stream);
        inner.deleted.insert(stream.to_owned());
    }

    /// Snapshot of a stream's contents, for diagnostics and tests.
    #[must_use]
    pub fn contents(&self, stream: &str) -> Vec<StoredEvent> {
        let inner = self.inner.read().expect("in-memory log lock poisoned");
        inner.streams.get(stream).cloned().unwrap_or_default()
    }

    fn read_stream(&self, stream: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let inner = self.inner.read().expect("in-memory log lock poisoned");
        if inner.deleted.contains(stream) {
            return Err(StoreError::StreamDeleted {
                stream: stream.to_owned(),
            });
        }
        Ok(inner.streams.get(stream).cloned().unwrap_or_default())
    }

    /// Account for the synthetic pages of a scan, emitting one slice metric
    /// per page and a rollup for the whole read.
    fn page_through(
        &self,
        stream: &str,
        event_sizes: &[usize],
        direction: Direction,
        started: Instant,
    ) -> Result<(), StoreError> {
        let batch_size = self.batching.batch_size.max(1);
        let mut batches = 0usize;
        for page in event_sizes.chunks(batch_size) {
            if let Some(max_batches) = self.batching.max_batches
                && batches >= max_batches
            {
                return Err(StoreError::BatchLimitExceeded {
                    stream: stream.to_owned(),
                    max_batches,
                });
            }
            batches += 1;
            self.observer.slice_read(&SliceMetric {
                stream: stream.to_owned(),
                elapsed: started.elapsed(),
                bytes: page.iter().sum(),
                count: page.len(),
                direction,
            });
        }
        self.observer.batch_read(&BatchMetric {
            stream: stream.to_owned(),
            elapsed: started.elapsed(),
            batches,
            count: event_sizes.len(),
            direction,
        });
        Ok(())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

fn sizes(events: &[StoredEvent]) -> Vec<usize> {
    events.iter().map(|event| event.data.len()).collect()
}

fn last_index(events: &[StoredEvent]) -> i64 {
    events.last().map_or(-1, |event| event.index)
}

impl EventLog for MemoryLog {
    fn batching(&self) -> &BatchingPolicy {
        &self.batching
    }

    #[tracing::instrument(skip(self, is_compaction))]
    async fn load_batched(
        &self,
        stream: &str,
        from_version: i64,
        is_compaction: Option<&CompactionPredicate>,
    ) -> LoadResult {
        let started = Instant::now();
        let events = self.read_stream(stream)?;
        let stream_version = last_index(&events);
        let scanned: Vec<StoredEvent> = events
            .into_iter()
            .filter(|event| event.index >= from_version)
            .collect();
        self.page_through(stream, &sizes(&scanned), Direction::Forward, started)?;

        let mut token = match is_compaction {
            Some(predicate) => {
                let snapshot = scanned
                    .iter()
                    .rev()
                    .find(|event| predicate(&event.kind))
                    .map(|event| event.index);
                StreamToken::of_snapshot_window(stream_version, snapshot, self.batching.window(), 0)
            }
            None => StreamToken::of_uncompacted(stream_version),
        };
        if from_version == 0 {
            let bytes: i64 = scanned.iter().map(|event| event.data.len() as i64).sum();
            token = token.with_stream_bytes(bytes);
        }
        Ok((token, scanned))
    }

    #[tracing::instrument(skip(self, try_decode, is_origin))]
    async fn load_backwards_until_origin<'a, E>(
        &'a self,
        stream: &'a str,
        try_decode: &'a (dyn Fn(&StoredEvent) -> Option<E> + Send + Sync),
        is_origin: &'a (dyn Fn(&E) -> bool + Send + Sync),
    ) -> DecodedLoadResult<E>
    where
        E: Send + 'a,
    {
        let started = Instant::now();
        let events = self.read_stream(stream)?;
        let stream_version = last_index(&events);

        let mut scanned: Vec<(StoredEvent, Option<E>)> = Vec::new();
        let mut origin = None;
        for event in events.into_iter().rev() {
            let decoded = try_decode(&event);
            let found = decoded.as_ref().is_some_and(|decoded| is_origin(decoded));
            let index = event.index;
            scanned.push((event, decoded));
            if found {
                origin = Some(index);
                break;
            }
        }
        let event_sizes: Vec<usize> = scanned.iter().map(|(event, _)| event.data.len()).collect();
        self.page_through(stream, &event_sizes, Direction::Backward, started)?;
        scanned.reverse();

        let token =
            StreamToken::of_snapshot_window(stream_version, origin, self.batching.window(), 0);
        Ok((token, scanned))
    }

    #[tracing::instrument(skip(self, token, is_compaction), fields(from_version = token.stream_version() + 1))]
    async fn load_from_token(
        &self,
        _require_leader: bool,
        stream: &str,
        token: &StreamToken,
        is_compaction: Option<&CompactionPredicate>,
    ) -> LoadResult {
        let started = Instant::now();
        let events = self.read_stream(stream)?;
        let stream_version = events.last().map_or(token.stream_version(), |e| e.index);
        let tail: Vec<StoredEvent> = events
            .into_iter()
            .filter(|event| event.index > token.stream_version())
            .collect();
        self.page_through(stream, &sizes(&tail), Direction::Forward, started)?;

        let new_token = match is_compaction {
            Some(predicate) => {
                let snapshot = tail
                    .iter()
                    .rev()
                    .find(|event| predicate(&event.kind))
                    .map(|event| event.index)
                    .or(token.snapshot_event_number());
                StreamToken::of_snapshot_window(stream_version, snapshot, self.batching.window(), 0)
            }
            None => StreamToken::of_uncompacted(stream_version),
        };
        Ok((new_token, tail))
    }

    #[tracing::instrument(skip(self, expected, events, is_compaction), fields(events_len = events.len(), expected_version = expected.version()))]
    async fn try_sync(
        &self,
        stream: &str,
        expected: &StreamToken,
        events: NonEmpty<PendingEvent>,
        is_compaction: Option<&CompactionPredicate>,
    ) -> Result<SyncResult, StoreError> {
        let started = Instant::now();
        let count = events.len();
        let bytes: usize = events.iter().map(|event| event.data.len()).sum();

        let mut inner = self.inner.write().expect("in-memory log lock poisoned");
        if inner.deleted.contains(stream) {
            return Err(StoreError::StreamDeleted {
                stream: stream.to_owned(),
            });
        }

        let current = inner
            .streams
            .get(stream)
            .map_or(-1, |events| last_index(events));
        if current != expected.stream_version() {
            drop(inner);
            self.observer.sync_conflicted(&WriteMetric {
                stream: stream.to_owned(),
                elapsed: started.elapsed(),
                bytes,
                count,
            });
            return Ok(SyncResult::ConflictUnknown(Some(
                StreamToken::of_uncompacted(current),
            )));
        }

        let token = {
            let kinds: Vec<&str> = events.iter().map(|event| event.kind.as_str()).collect();
            StreamToken::after_append(expected, &kinds, is_compaction, self.batching.window())
        };

        let entries = inner.streams.entry(stream.to_owned()).or_default();
        for (offset, event) in events.into_iter().enumerate() {
            entries.push(StoredEvent {
                id: event.id,
                index: expected.stream_version() + 1 + offset as i64,
                kind: event.kind,
                data: event.data,
                metadata: event.metadata,
            });
        }
        let total_bytes: i64 = entries.iter().map(|event| event.data.len() as i64).sum();
        drop(inner);

        self.observer.sync_succeeded(&WriteMetric {
            stream: stream.to_owned(),
            elapsed: started.elapsed(),
            bytes,
            count,
        });
        Ok(SyncResult::Written(token.with_stream_bytes(total_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(kind: &str, payload: &[u8]) -> PendingEvent {
        PendingEvent::new(kind, payload.to_vec())
    }

    fn batch(events: Vec<PendingEvent>) -> NonEmpty<PendingEvent> {
        NonEmpty::from_vec(events).expect("test batches are non-empty")
    }

    async fn seed(log: &MemoryLog, stream: &str, kinds: &[&str]) -> StreamToken {
        let events = kinds
            .iter()
            .map(|kind| pending(kind, br#"{"n":1}"#))
            .collect();
        let expected = StreamToken::for_empty_stream(None);
        match log
            .try_sync(stream, &expected, batch(events), None)
            .await
            .unwrap()
        {
            SyncResult::Written(token) => token,
            SyncResult::ConflictUnknown(_) => panic!("seeding an empty stream cannot conflict"),
        }
    }

    #[tokio::test]
    async fn empty_stream_loads_as_version_zero() {
        let log = MemoryLog::new();
        let (token, events) = log.load_batched("Counter-1", 0, None).await.unwrap();
        assert_eq!(token.version(), 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let log = MemoryLog::new();
        let token = seed(&log, "Counter-1", &["added", "added"]).await;
        assert_eq!(token.version(), 2);
        assert!(token.stream_bytes().is_some());

        let (token, events) = log.load_batched("Counter-1", 0, None).await.unwrap();
        assert_eq!(token.version(), 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].index, 0);
        assert_eq!(events[1].index, 1);
    }

    #[tokio::test]
    async fn stale_token_conflicts_and_reports_actual_version() {
        let log = MemoryLog::new();
        seed(&log, "Counter-1", &["added"]).await;

        let stale = StreamToken::for_empty_stream(None);
        let result = log
            .try_sync("Counter-1", &stale, batch(vec![pending("added", b"{}")]), None)
            .await
            .unwrap();
        match result {
            SyncResult::ConflictUnknown(Some(actual)) => assert_eq!(actual.version(), 1),
            other => panic!("expected conflict, got {other:?}"),
        }
        // Nothing was appended.
        assert_eq!(log.contents("Counter-1").len(), 1);
    }

    #[tokio::test]
    async fn load_from_token_returns_only_the_tail() {
        let log = MemoryLog::new();
        let first = seed(&log, "Counter-1", &["added"]).await;
        let result = log
            .try_sync(
                "Counter-1",
                &first,
                batch(vec![pending("added", b"{}"), pending("added", b"{}")]),
                None,
            )
            .await
            .unwrap();
        let SyncResult::Written(head) = result else {
            panic!("sync against the current token must succeed");
        };

        let (token, tail) = log
            .load_from_token(false, "Counter-1", &first, None)
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 1);
        assert_eq!(token.version(), head.version());
    }

    #[tokio::test]
    async fn backward_scan_stops_at_origin_inclusive() {
        let log = MemoryLog::new();
        seed(&log, "Counter-1", &["added", "snapshotted", "added"]).await;

        let decode = |event: &StoredEvent| Some(event.kind.clone());
        let origin = |kind: &String| kind == "snapshotted";
        let (token, events) = log
            .load_backwards_until_origin("Counter-1", &decode, &origin)
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0.index, 1);
        assert_eq!(events[1].0.index, 2);
        assert_eq!(token.version(), 3);
        assert_eq!(token.snapshot_event_number(), Some(1));
    }

    #[tokio::test]
    async fn backward_scan_without_origin_reads_whole_stream() {
        let log = MemoryLog::new();
        seed(&log, "Counter-1", &["added", "added"]).await;

        let decode = |event: &StoredEvent| Some(event.kind.clone());
        let origin = |_: &String| false;
        let (token, events) = log
            .load_backwards_until_origin("Counter-1", &decode, &origin)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(token.snapshot_event_number(), None);
    }

    #[tokio::test]
    async fn compaction_predicate_marks_last_matching_event() {
        let log = MemoryLog::new();
        seed(
            &log,
            "Counter-1",
            &["snapshotted", "added", "snapshotted", "added"],
        )
        .await;

        let is_snapshot: &CompactionPredicate = &|kind| kind == "snapshotted";
        let (token, _) = log
            .load_batched("Counter-1", 0, Some(is_snapshot))
            .await
            .unwrap();
        assert_eq!(token.snapshot_event_number(), Some(2));
        assert!(token.batch_capacity_limit().is_some());
    }

    #[tokio::test]
    async fn scans_over_the_page_cap_fail() {
        let log = MemoryLog::with_batching(BatchingPolicy::new(2).with_max_batches(2));
        seed(&log, "Counter-1", &["a", "b", "c", "d", "e"]).await;

        let error = log.load_batched("Counter-1", 0, None).await.unwrap_err();
        assert!(matches!(
            error,
            StoreError::BatchLimitExceeded { max_batches: 2, .. }
        ));
    }

    #[tokio::test]
    async fn deleted_streams_are_fatal() {
        let log = MemoryLog::new();
        seed(&log, "Counter-1", &["added"]).await;
        log.delete_stream("Counter-1");

        let error = log.load_batched("Counter-1", 0, None).await.unwrap_err();
        assert!(matches!(error, StoreError::StreamDeleted { .. }));

        let error = log
            .try_sync(
                "Counter-1",
                &StreamToken::for_empty_stream(None),
                batch(vec![pending("added", b"{}")]),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::StreamDeleted { .. }));
    }
}

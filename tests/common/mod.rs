//! Shared test domain: a write-once value per stream.
//!
//! `Assigned` sets the value, `Snapshotted` is the rolling-snapshot form of
//! the folded state. The idempotent-assign decision makes no-op commits easy
//! to provoke: deciding against an already-set value yields no events.

#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tidemark::{
    AccessStrategy, CachingStrategy, Category, DomainEvent, EventCodec, Fold, ResyncFetch,
    ResyncPolicy,
    codec::Json,
    metrics::{BatchMetric, Direction, StoreObserver, WriteMetric},
    store::{EventLog, NonEmpty, SyncResult, memory::MemoryLog},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueEvent {
    Assigned { value: i32 },
    Snapshotted { value: Option<i32> },
}

impl DomainEvent for ValueEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Assigned { .. } => "assigned",
            Self::Snapshotted { .. } => "snapshotted",
        }
    }
}

pub struct ValueFold;

impl Fold for ValueFold {
    type Event = ValueEvent;
    type State = Option<i32>;

    fn initial(&self) -> Option<i32> {
        None
    }

    fn fold(&self, state: Option<i32>, events: &[ValueEvent]) -> Option<i32> {
        events.iter().fold(state, |state, event| match event {
            ValueEvent::Assigned { value } => Some(*value),
            ValueEvent::Snapshotted { value } => *value,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Set(i32),
    AlreadySet(i32),
}

/// Idempotent assignment: a second identical decision is a no-op commit.
pub fn decide_set(value: i32) -> impl FnMut(&Option<i32>) -> (Outcome, Vec<ValueEvent>) {
    move |state| match state {
        Some(current) => (Outcome::AlreadySet(*current), Vec::new()),
        None => (Outcome::Set(value), vec![ValueEvent::Assigned { value }]),
    }
}

pub type ValueCategory = Category<MemoryLog, Json<ValueEvent>, ValueFold>;

pub fn unrestricted(
    log: MemoryLog,
    caching: Option<CachingStrategy<Option<i32>>>,
) -> Arc<ValueCategory> {
    Arc::new(
        Category::new(
            log,
            Json::new(),
            ValueFold,
            AccessStrategy::Unrestricted,
            caching,
        )
        .expect("unrestricted categories have no invalid configurations"),
    )
}

pub fn rolling_strategy() -> AccessStrategy<ValueEvent, Option<i32>> {
    AccessStrategy::rolling_snapshots(
        |event| matches!(event, ValueEvent::Snapshotted { .. }),
        |state: &Option<i32>| ValueEvent::Snapshotted { value: *state },
        |kind| kind == "snapshotted",
    )
}

pub fn rolling(log: MemoryLog) -> Arc<ValueCategory> {
    Arc::new(
        Category::new(log, Json::new(), ValueFold, rolling_strategy(), None)
            .expect("rolling-snapshot categories without caching are valid"),
    )
}

/// Append events to a stream the way a competing writer would, bypassing any
/// decider or cache.
pub async fn append_concurrently(log: &MemoryLog, stream: &str, events: &[ValueEvent]) {
    let codec = Json::<ValueEvent>::new();
    let (token, _) = log
        .load_batched(stream, 0, None)
        .await
        .expect("competing writer can load the stream");
    let pending = events
        .iter()
        .map(|event| codec.encode(event).expect("test events encode"))
        .collect();
    let result = log
        .try_sync(
            stream,
            &token,
            NonEmpty::from_vec(pending).expect("competing writer appends at least one event"),
            None,
        )
        .await
        .expect("competing writer can sync");
    assert!(
        matches!(result, SyncResult::Written(_)),
        "competing writer raced another appender inside a test"
    );
}

/// Observer tallying backend traffic, for asserting which paths did I/O.
#[derive(Default)]
pub struct CountingObserver {
    pub loads: AtomicUsize,
    pub backward_loads: AtomicUsize,
    pub loaded_events: AtomicUsize,
    pub writes: AtomicUsize,
    pub conflicts: AtomicUsize,
}

impl CountingObserver {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn backward_loads(&self) -> usize {
        self.backward_loads.load(Ordering::SeqCst)
    }

    pub fn loaded_events(&self) -> usize {
        self.loaded_events.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

impl StoreObserver for CountingObserver {
    fn batch_read(&self, metric: &BatchMetric) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if metric.direction == Direction::Backward {
            self.backward_loads.fetch_add(1, Ordering::SeqCst);
        }
        self.loaded_events.fetch_add(metric.count, Ordering::SeqCst);
    }

    fn sync_succeeded(&self, _metric: &WriteMetric) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_conflicted(&self, _metric: &WriteMetric) {
        self.conflicts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resync policy that lets the reload complete, then moves the stream again,
/// so every retry meets a fresh conflict.
pub struct InterfereAfterResync {
    pub log: MemoryLog,
    pub stream: String,
}

impl ResyncPolicy<Option<i32>> for InterfereAfterResync {
    fn apply<'a>(
        &'a self,
        _attempt: u32,
        resync: BoxFuture<'a, ResyncFetch<Option<i32>>>,
    ) -> BoxFuture<'a, ResyncFetch<Option<i32>>>
    where
        Option<i32>: 'a,
    {
        Box::pin(async move {
            let refreshed = resync.await;
            append_concurrently(&self.log, &self.stream, &[ValueEvent::Assigned { value: -1 }])
                .await;
            refreshed
        })
    }
}

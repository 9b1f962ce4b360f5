//! Per-stream-category policy.
//!
//! A [`Category`] owns everything that is uniform across the streams of one
//! category: the codec, the fold, the initial state, the [`AccessStrategy`],
//! and an optional cache binding. It selects the load algorithm from the
//! access strategy, replays cached state forward from its token, and carries
//! rolling snapshots into write batches when they fall due.
//!
//! The cache binding is plain composition: there is no decorator stack, just
//! an optional [`CachingStrategy`] consulted on the load and sync paths.

use std::sync::Arc;

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    ConfigError,
    cache::CachingStrategy,
    codec::EventCodec,
    compaction::CompactionContext,
    store::{CompactionPredicate, EventLog, PendingEvent, StoreError, StoredEvent, SyncResult},
    token::StreamToken,
};

/// Left-fold of events into category state.
pub trait Fold: Send + Sync {
    /// Domain event type.
    type Event;

    /// Folded state type.
    type State: Clone + Send + Sync;

    /// State of a stream that holds no events.
    fn initial(&self) -> Self::State;

    /// Apply `events` in order.
    fn fold(&self, state: Self::State, events: &[Self::Event]) -> Self::State;
}

type OriginPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type SnapshotFn<S, E> = Arc<dyn Fn(&S) -> E + Send + Sync>;
type KindPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How streams of this category are read and compacted.
pub enum AccessStrategy<E, S> {
    /// Forward scan from the stream start; no compaction.
    Unrestricted,
    /// Only the single most recent decodable event is needed to
    /// reconstitute state; loads scan backwards and stop at the first
    /// decodable event. Incompatible with caching.
    LatestKnownEvent,
    /// Forward reads short-circuit at the most recent origin event, and
    /// syncs that exhaust the stream's headroom append a snapshot produced
    /// by `to_snapshot` in the same batch.
    RollingSnapshots {
        /// Recognises origin events among decoded events.
        is_origin: OriginPredicate<E>,
        /// Produces the snapshot event for the post-batch state.
        to_snapshot: SnapshotFn<S, E>,
        /// Recognises snapshot events by kind, for token bookkeeping on the
        /// raw side of the codec.
        is_snapshot_kind: KindPredicate,
    },
}

impl<E, S> AccessStrategy<E, S> {
    /// Convenience constructor for [`AccessStrategy::RollingSnapshots`].
    pub fn rolling_snapshots(
        is_origin: impl Fn(&E) -> bool + Send + Sync + 'static,
        to_snapshot: impl Fn(&S) -> E + Send + Sync + 'static,
        is_snapshot_kind: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::RollingSnapshots {
            is_origin: Arc::new(is_origin),
            to_snapshot: Arc::new(to_snapshot),
            is_snapshot_kind: Arc::new(is_snapshot_kind),
        }
    }
}

impl<E, S> Clone for AccessStrategy<E, S> {
    fn clone(&self) -> Self {
        match self {
            Self::Unrestricted => Self::Unrestricted,
            Self::LatestKnownEvent => Self::LatestKnownEvent,
            Self::RollingSnapshots {
                is_origin,
                to_snapshot,
                is_snapshot_kind,
            } => Self::RollingSnapshots {
                is_origin: Arc::clone(is_origin),
                to_snapshot: Arc::clone(to_snapshot),
                is_snapshot_kind: Arc::clone(is_snapshot_kind),
            },
        }
    }
}

/// Failures on the category's load and sync paths.
#[derive(Debug, Error)]
pub enum CategoryError {
    /// An event could not be encoded for append.
    #[error("failed to encode event for append: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The log refused or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of [`Category::sync`].
#[derive(Debug)]
pub enum SyncOutcome<S> {
    /// The batch was appended; `state` already folds the new events in.
    Written { token: StreamToken, state: S },
    /// The stream moved under us. Carries the backend's observed token when
    /// available.
    Conflict { actual: Option<StreamToken> },
}

/// Policy object for one stream category.
pub struct Category<L, C, F>
where
    F: Fold,
{
    log: L,
    codec: C,
    fold: F,
    access: AccessStrategy<F::Event, F::State>,
    caching: Option<CachingStrategy<F::State>>,
}

impl<L, C, F> std::fmt::Debug for Category<L, C, F>
where
    F: Fold,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Category").finish_non_exhaustive()
    }
}

impl<L, C, F> Category<L, C, F>
where
    L: EventLog,
    F: Fold,
    C: EventCodec<Event = F::Event>,
    F::Event: Send + Sync,
{
    /// Build a category policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for [`AccessStrategy::LatestKnownEvent`]
    /// combined with a cache: the latest-event read is already cheaper than a
    /// cache probe, and mixing them would invalidate invalidation.
    pub fn new(
        log: L,
        codec: C,
        fold: F,
        access: AccessStrategy<F::Event, F::State>,
        caching: Option<CachingStrategy<F::State>>,
    ) -> Result<Self, ConfigError> {
        if matches!(access, AccessStrategy::LatestKnownEvent) && caching.is_some() {
            return Err(ConfigError::new(
                "LatestKnownEvent loads cannot be combined with a cache",
            ));
        }
        Ok(Self {
            log,
            codec,
            fold,
            access,
            caching,
        })
    }

    /// The log this category reads and writes through.
    #[must_use]
    pub fn log(&self) -> &L {
        &self.log
    }

    /// State of a stream that holds no events.
    #[must_use]
    pub fn initial_state(&self) -> F::State {
        self.fold.initial()
    }

    /// Token to pair with [`Self::initial_state`] when a load is skipped.
    #[must_use]
    pub fn empty_token(&self) -> StreamToken {
        match &self.access {
            AccessStrategy::RollingSnapshots { .. } => {
                StreamToken::for_empty_stream(Some(self.log.batching().window()))
            }
            AccessStrategy::Unrestricted | AccessStrategy::LatestKnownEvent => {
                StreamToken::for_empty_stream(None)
            }
        }
    }

    fn compaction_predicate(&self) -> Option<&CompactionPredicate> {
        match &self.access {
            AccessStrategy::RollingSnapshots {
                is_snapshot_kind, ..
            } => Some(&**is_snapshot_kind),
            AccessStrategy::Unrestricted | AccessStrategy::LatestKnownEvent => None,
        }
    }

    /// Obtain `(token, state)` for a stream, honouring the cache binding.
    ///
    /// With `allow_stale` a live cache entry is returned as-is, with no
    /// backend round-trip; otherwise a cache hit is brought up to date by
    /// replaying the stream tail from its token.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the underlying log.
    #[tracing::instrument(skip(self))]
    pub async fn load(
        &self,
        stream: &str,
        allow_stale: bool,
    ) -> Result<(StreamToken, F::State), StoreError> {
        let Some(caching) = &self.caching else {
            return self.load_fresh(stream).await;
        };

        match caching.try_get(stream) {
            Some((token, state)) if allow_stale => {
                tracing::trace!(stream, version = token.version(), "serving stale cache hit");
                Ok((token, state))
            }
            Some((token, state)) => {
                let (token, state) = self.reload_from(stream, false, &token, state).await?;
                caching.update_if_newer(stream, token.clone(), state.clone());
                Ok((token, state))
            }
            None => {
                let (token, state) = self.load_fresh(stream).await?;
                caching.update_if_newer(stream, token.clone(), state.clone());
                Ok((token, state))
            }
        }
    }

    /// Full load via the access strategy's algorithm, bypassing the cache.
    async fn load_fresh(&self, stream: &str) -> Result<(StreamToken, F::State), StoreError> {
        match &self.access {
            AccessStrategy::Unrestricted => {
                let (token, raw) = self.log.load_batched(stream, 0, None).await?;
                let events: Vec<F::Event> = raw
                    .iter()
                    .filter_map(|stored| self.codec.try_decode(stored))
                    .collect();
                Ok((token, self.fold.fold(self.fold.initial(), &events)))
            }
            AccessStrategy::LatestKnownEvent => {
                let decode = |stored: &StoredEvent| self.codec.try_decode(stored);
                let newest = |_: &F::Event| true;
                let (token, pairs) = self
                    .log
                    .load_backwards_until_origin(stream, &decode, &newest)
                    .await?;
                let events: Vec<F::Event> =
                    pairs.into_iter().filter_map(|(_, decoded)| decoded).collect();
                Ok((token, self.fold.fold(self.fold.initial(), &events)))
            }
            AccessStrategy::RollingSnapshots { is_origin, .. } => {
                let decode = |stored: &StoredEvent| self.codec.try_decode(stored);
                let origin = |event: &F::Event| (**is_origin)(event);
                let (token, pairs) = self
                    .log
                    .load_backwards_until_origin(stream, &decode, &origin)
                    .await?;
                let events: Vec<F::Event> =
                    pairs.into_iter().filter_map(|(_, decoded)| decoded).collect();
                Ok((token, self.fold.fold(self.fold.initial(), &events)))
            }
        }
    }

    /// Replay the stream tail after `token` onto `state`.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from the underlying log.
    #[tracing::instrument(skip(self, token, state), fields(from_version = token.version()))]
    pub async fn reload_from(
        &self,
        stream: &str,
        require_leader: bool,
        token: &StreamToken,
        state: F::State,
    ) -> Result<(StreamToken, F::State), StoreError> {
        let (token, raw) = self
            .log
            .load_from_token(require_leader, stream, token, self.compaction_predicate())
            .await?;
        let events: Vec<F::Event> = raw
            .iter()
            .filter_map(|stored| self.codec.try_decode(stored))
            .collect();
        Ok((token, self.fold.fold(state, &events)))
    }

    /// Append `events` under `token`'s version precondition.
    ///
    /// Under [`AccessStrategy::RollingSnapshots`] a due compaction adds a
    /// snapshot of the post-batch state to the write. On success the cache
    /// is refreshed with the folded state; on conflict it is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CategoryError::Codec`] when an event cannot be encoded and
    /// [`CategoryError::Store`] for log failures. A version conflict is not
    /// an error; it comes back as [`SyncOutcome::Conflict`].
    #[tracing::instrument(skip(self, token, state, events), fields(events_len = events.len(), expected_version = token.version()))]
    pub async fn sync(
        &self,
        stream: &str,
        token: &StreamToken,
        state: &F::State,
        events: &[F::Event],
    ) -> Result<SyncOutcome<F::State>, CategoryError> {
        let mut pending: Vec<PendingEvent> = events
            .iter()
            .map(|event| {
                self.codec
                    .encode(event)
                    .map_err(|error| CategoryError::Codec(Box::new(error)))
            })
            .collect::<Result<_, _>>()?;

        if let AccessStrategy::RollingSnapshots { to_snapshot, .. } = &self.access
            && let Some(capacity) = token.batch_capacity_limit()
            && CompactionContext::new(events.len(), capacity).is_compaction_due()
        {
            let state_after = self.fold.fold(state.clone(), events);
            let snapshot = (**to_snapshot)(&state_after);
            pending.push(
                self.codec
                    .encode(&snapshot)
                    .map_err(|error| CategoryError::Codec(Box::new(error)))?,
            );
            tracing::debug!(stream, "appending rolling snapshot to write batch");
        }

        let batch = NonEmpty::from_vec(pending).expect("sync is never called with an empty batch");
        let result = self
            .log
            .try_sync(stream, token, batch, self.compaction_predicate())
            .await?;

        match result {
            SyncResult::Written(new_token) => {
                let new_state = self.fold.fold(state.clone(), events);
                if let Some(caching) = &self.caching {
                    caching.update_if_newer(stream, new_token.clone(), new_state.clone());
                }
                Ok(SyncOutcome::Written {
                    token: new_token,
                    state: new_state,
                })
            }
            SyncResult::ConflictUnknown(actual) => Ok(SyncOutcome::Conflict { actual }),
        }
    }
}

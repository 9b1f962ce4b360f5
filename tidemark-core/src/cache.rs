//! Stream-state caching.
//!
//! A [`StateCache`] maps cache keys to `(token, state)` pairs. Entries are
//! guarded by per-entry mutexes and arbitrated by
//! [`StreamToken::supersedes`], so an older load completing late can never
//! overwrite a newer one. Entries are reconstructible by definition; the
//! cache is free to drop them on expiry or when its size bound is hit.
//!
//! Categories wire a cache in through a [`CachingStrategy`], which decides
//! the key shape and the expiration policy applied on insert and update.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use crate::token::StreamToken;

const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Entry lifetime policy.
#[derive(Clone, Copy, Debug)]
pub enum Expiration {
    /// Drop the entry at a fixed deadline.
    Absolute(Instant),
    /// Drop the entry after a period of no access; every read slides the
    /// deadline forward.
    Sliding(Duration),
}

impl Expiration {
    fn deadline(&self, now: Instant) -> Instant {
        match self {
            Self::Absolute(at) => *at,
            Self::Sliding(window) => now + *window,
        }
    }
}

struct CacheEntry<S> {
    token: StreamToken,
    state: S,
    expiration: Expiration,
    expires_at: Instant,
}

type SharedEntry<S> = Arc<Mutex<CacheEntry<S>>>;

/// Size-bounded map of cache keys to `(token, state)` entries.
pub struct StateCache<S> {
    entries: RwLock<HashMap<String, SharedEntry<S>>>,
    max_entries: usize,
}

impl<S> StateCache<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    #[must_use]
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> Default for StateCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> StateCache<S> {
    /// Look up a live entry, refreshing sliding deadlines on the way out.
    #[must_use]
    pub fn try_get(&self, key: &str) -> Option<(StreamToken, S)> {
        let entry = {
            let entries = self.entries.read().expect("cache lock poisoned");
            entries.get(key).cloned()
        }?;

        let now = Instant::now();
        let hit = {
            let mut guard = entry.lock().expect("cache entry lock poisoned");
            if guard.expires_at <= now {
                None
            } else {
                if let Expiration::Sliding(window) = guard.expiration {
                    guard.expires_at = now + window;
                }
                Some((guard.token.clone(), guard.state.clone()))
            }
        };

        if hit.is_none() {
            self.remove_expired(key, &entry, now);
        }
        tracing::trace!(key, hit = hit.is_some(), "cache lookup");
        hit
    }

    /// Insert or refresh an entry, keeping whichever `(token, state)` pair
    /// reflects the later stream state.
    ///
    /// A freshly inserted entry adopts `expiration`; an existing entry only
    /// adopts it when the incoming token supersedes the incumbent's.
    pub fn update_if_newer(
        &self,
        key: &str,
        expiration: Expiration,
        token: StreamToken,
        state: S,
    ) {
        let existing = {
            let entries = self.entries.read().expect("cache lock poisoned");
            entries.get(key).cloned()
        };
        if let Some(entry) = existing {
            Self::merge(&entry, expiration, token, state);
            return;
        }

        let now = Instant::now();
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            // Lost an insert race; arbitrate against the winner.
            Self::merge(entry, expiration, token, state);
            return;
        }
        if entries.len() >= self.max_entries {
            Self::evict(&mut entries, now, self.max_entries);
        }
        entries.insert(
            key.to_owned(),
            Arc::new(Mutex::new(CacheEntry {
                token,
                state,
                expiration,
                expires_at: expiration.deadline(now),
            })),
        );
    }

    fn merge(entry: &SharedEntry<S>, expiration: Expiration, token: StreamToken, state: S) {
        let mut guard = entry.lock().expect("cache entry lock poisoned");
        if token.supersedes(&guard.token) {
            guard.token = token;
            guard.state = state;
            guard.expiration = expiration;
            guard.expires_at = expiration.deadline(Instant::now());
        }
    }

    /// Drop `entry` if it is still the one mapped at `key` and still expired.
    /// Entry locks are only taken while holding the map lock, never the other
    /// way round.
    fn remove_expired(&self, key: &str, entry: &SharedEntry<S>, now: Instant) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if let Some(current) = entries.get(key)
            && Arc::ptr_eq(current, entry)
        {
            let expired = {
                let guard = current.lock().expect("cache entry lock poisoned");
                guard.expires_at <= now
            };
            if expired {
                entries.remove(key);
            }
        }
    }

    fn evict(entries: &mut HashMap<String, SharedEntry<S>>, now: Instant, max_entries: usize) {
        entries.retain(|_, entry| {
            entry
                .lock()
                .expect("cache entry lock poisoned")
                .expires_at
                > now
        });
        while entries.len() >= max_entries {
            let victim = entries
                .iter()
                .min_by_key(|(_, entry)| {
                    entry.lock().expect("cache entry lock poisoned").expires_at
                })
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// How a category binds to a [`StateCache`].
#[derive(Clone)]
pub enum CachingStrategy<S> {
    /// Sliding expiration; every access pushes the deadline out.
    SlidingWindow {
        cache: Arc<StateCache<S>>,
        window: Duration,
    },
    /// Absolute expiration measured from insertion or refresh.
    FixedTimeSpan {
        cache: Arc<StateCache<S>>,
        period: Duration,
    },
    /// Sliding expiration with keys prefixed per category, so several folds
    /// over the same stream keep distinct entries.
    SlidingWindowPrefixed {
        cache: Arc<StateCache<S>>,
        window: Duration,
        prefix: String,
    },
}

impl<S: Clone> CachingStrategy<S> {
    #[must_use]
    pub fn sliding_window(cache: Arc<StateCache<S>>, window: Duration) -> Self {
        Self::SlidingWindow { cache, window }
    }

    #[must_use]
    pub fn fixed_time_span(cache: Arc<StateCache<S>>, period: Duration) -> Self {
        Self::FixedTimeSpan { cache, period }
    }

    #[must_use]
    pub fn sliding_window_prefixed(
        cache: Arc<StateCache<S>>,
        window: Duration,
        prefix: impl Into<String>,
    ) -> Self {
        Self::SlidingWindowPrefixed {
            cache,
            window,
            prefix: prefix.into(),
        }
    }

    fn cache(&self) -> &StateCache<S> {
        match self {
            Self::SlidingWindow { cache, .. }
            | Self::FixedTimeSpan { cache, .. }
            | Self::SlidingWindowPrefixed { cache, .. } => cache,
        }
    }

    fn key(&self, stream: &str) -> String {
        match self {
            Self::SlidingWindowPrefixed { prefix, .. } => format!("{prefix}{stream}"),
            Self::SlidingWindow { .. } | Self::FixedTimeSpan { .. } => stream.to_owned(),
        }
    }

    fn expiration(&self) -> Expiration {
        match self {
            Self::SlidingWindow { window, .. } | Self::SlidingWindowPrefixed { window, .. } => {
                Expiration::Sliding(*window)
            }
            Self::FixedTimeSpan { period, .. } => Expiration::Absolute(Instant::now() + *period),
        }
    }

    pub(crate) fn try_get(&self, stream: &str) -> Option<(StreamToken, S)> {
        self.cache().try_get(&self.key(stream))
    }

    pub(crate) fn update_if_newer(&self, stream: &str, token: StreamToken, state: S) {
        self.cache()
            .update_if_newer(&self.key(stream), self.expiration(), token, state);
    }
}

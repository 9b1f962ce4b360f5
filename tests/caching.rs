//! Integration tests for cache wiring: staleness, coherence, expiry, and
//! supersede arbitration through the public API.

mod common;

use std::{sync::Arc, time::Duration};

use common::{CountingObserver, ValueEvent, ValueFold, unrestricted};
use tidemark::{
    AccessStrategy, CachingStrategy, Category, Decider, Expiration, LoadOption, StateCache,
    StreamToken, codec::Json, store::memory::MemoryLog,
};

fn sliding(cache: Arc<StateCache<Option<i32>>>) -> CachingStrategy<Option<i32>> {
    CachingStrategy::sliding_window(cache, Duration::from_secs(60))
}

#[tokio::test]
async fn stale_reads_serve_the_cache_without_backend_io() {
    let observer = Arc::new(CountingObserver::default());
    let log = MemoryLog::new().with_observer(observer.clone());
    let stream = "Value-1";

    let writer = Decider::new(unrestricted(log.clone(), None), stream);
    writer
        .transact(
            |_| vec![ValueEvent::Assigned { value: 1 }],
            LoadOption::default(),
        )
        .await
        .unwrap();

    // Reader caches version 1, then the writer moves on to version 2.
    let reader = Decider::new(
        unrestricted(log.clone(), Some(sliding(Arc::new(StateCache::new())))),
        stream,
    );
    reader.query(|_| (), LoadOption::default()).await.unwrap();
    writer
        .transact(
            |_| vec![ValueEvent::Assigned { value: 2 }],
            LoadOption::default(),
        )
        .await
        .unwrap();

    let loads_before = observer.loads();
    let (version, state) = reader
        .query_ex(|ctx| (ctx.version(), *ctx.state()), LoadOption::AllowStale)
        .await
        .unwrap();
    assert_eq!((version, state), (1, Some(1)));
    assert_eq!(observer.loads(), loads_before, "stale read must not touch the backend");

    // The next strict read replays just the tail and sees the new write.
    let (version, state) = reader
        .query_ex(|ctx| (ctx.version(), *ctx.state()), LoadOption::default())
        .await
        .unwrap();
    assert_eq!((version, state), (2, Some(2)));
    assert_eq!(observer.loads(), loads_before + 1);
}

#[tokio::test]
async fn a_written_outcome_updates_the_cache_in_band() {
    let observer = Arc::new(CountingObserver::default());
    let log = MemoryLog::new().with_observer(observer.clone());
    let stream = "Value-1";

    let decider = Decider::new(
        unrestricted(log, Some(sliding(Arc::new(StateCache::new())))),
        stream,
    );
    decider
        .transact(
            |_| vec![ValueEvent::Assigned { value: 5 }],
            LoadOption::default(),
        )
        .await
        .unwrap();

    let loads_before = observer.loads();
    let events_before = observer.loaded_events();
    let (version, state) = decider
        .query_ex(|ctx| (ctx.version(), *ctx.state()), LoadOption::default())
        .await
        .unwrap();

    assert_eq!((version, state), (1, Some(5)));
    // One tail probe from the cached token, which came back empty.
    assert_eq!(observer.loads(), loads_before + 1);
    assert_eq!(observer.loaded_events(), events_before);
}

#[tokio::test]
async fn expired_fixed_window_entries_force_a_full_reload() {
    let observer = Arc::new(CountingObserver::default());
    let log = MemoryLog::new().with_observer(observer.clone());
    let stream = "Value-1";

    let caching =
        CachingStrategy::fixed_time_span(Arc::new(StateCache::new()), Duration::from_millis(40));
    let decider = Decider::new(unrestricted(log, Some(caching)), stream);
    decider
        .transact(
            |_| vec![ValueEvent::Assigned { value: 5 }],
            LoadOption::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    let events_before = observer.loaded_events();
    decider.query(|_| (), LoadOption::default()).await.unwrap();
    // The entry had lapsed, so the whole stream was re-read.
    assert_eq!(observer.loaded_events(), events_before + 1);
}

#[tokio::test]
async fn prefixed_strategies_isolate_folds_sharing_a_stream() {
    let observer = Arc::new(CountingObserver::default());
    let log = MemoryLog::new().with_observer(observer.clone());
    let stream = "Value-1";
    let shared = Arc::new(StateCache::new());

    let summary = Decider::new(
        unrestricted(
            log.clone(),
            Some(CachingStrategy::sliding_window_prefixed(
                Arc::clone(&shared),
                Duration::from_secs(60),
                "summary:",
            )),
        ),
        stream,
    );
    let audit = Decider::new(
        unrestricted(
            log,
            Some(CachingStrategy::sliding_window_prefixed(
                Arc::clone(&shared),
                Duration::from_secs(60),
                "audit:",
            )),
        ),
        stream,
    );

    summary
        .transact(
            |_| vec![ValueEvent::Assigned { value: 5 }],
            LoadOption::default(),
        )
        .await
        .unwrap();

    // The audit fold misses under its own prefix and performs a full load
    // rather than borrowing the summary entry.
    let events_before = observer.loaded_events();
    audit.query(|_| (), LoadOption::default()).await.unwrap();
    assert_eq!(observer.loaded_events(), events_before + 1);
    assert_eq!(shared.len(), 2);
}

#[tokio::test]
async fn supersede_arbitration_holds_regardless_of_update_order() {
    let newer = StreamToken::of_uncompacted(4);
    let older = StreamToken::of_uncompacted(2);
    let expiration = Expiration::Sliding(Duration::from_secs(60));

    let cache = StateCache::new();
    cache.update_if_newer("k", expiration, older.clone(), Some(1));
    cache.update_if_newer("k", expiration, newer.clone(), Some(2));
    assert_eq!(cache.try_get("k").unwrap().1, Some(2));

    let cache = StateCache::new();
    cache.update_if_newer("k", expiration, newer, Some(2));
    cache.update_if_newer("k", expiration, older, Some(1));
    assert_eq!(cache.try_get("k").unwrap().1, Some(2));
}

#[tokio::test]
async fn latest_known_event_with_a_cache_is_rejected() {
    let error = Category::new(
        MemoryLog::new(),
        Json::<ValueEvent>::new(),
        ValueFold,
        AccessStrategy::LatestKnownEvent,
        Some(sliding(Arc::new(StateCache::new()))),
    )
    .unwrap_err();
    assert!(error.reason().contains("LatestKnownEvent"));
}

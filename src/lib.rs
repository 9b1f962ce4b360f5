#![doc = include_str!("../README.md")]

pub use tidemark_core::{
    ConfigError,
    cache::{self, CachingStrategy, Expiration, StateCache},
    category::{AccessStrategy, Category, CategoryError, Fold, SyncOutcome},
    codec::{self, DomainEvent, EventCodec},
    compaction::CompactionContext,
    decider::{
        Decider, DeciderError, ImmediateResync, LinearBackoff, LoadOption, ResyncFetch,
        ResyncPolicy, SyncContext,
    },
    metrics,
    token::StreamToken,
};

pub mod store {

    pub use tidemark_core::store::{
        BatchingPolicy, CompactionPredicate, EventLog, NonEmpty, PendingEvent, StoreError,
        StoredEvent, StreamName, SyncResult, memory,
    };

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use tidemark_postgres::{Error, RetryPolicy, Store};
    }
}

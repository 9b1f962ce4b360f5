//! Event encoding boundary.
//!
//! A [`Category`](crate::category::Category) never sees raw bytes and an
//! [`EventLog`](crate::store::EventLog) never sees domain events; the
//! [`EventCodec`] sits between them. Decoding is total: events the codec does
//! not recognise come back as `None` and are skipped by folds, which is what
//! lets old readers coexist with newer writers.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::store::{PendingEvent, StoredEvent};

/// Marker trait giving each event value a stable kind identifier.
///
/// The kind is stored alongside the payload and is what compaction
/// predicates match on. Use lowercase, kebab-case for consistency:
/// `"assigned"`, `"snapshot-taken"`, etc.
pub trait DomainEvent {
    fn kind(&self) -> &'static str;
}

/// Bidirectional event serialization for one category.
pub trait EventCodec: Send + Sync {
    /// Domain event type this codec understands.
    type Event;

    /// Encoding failure type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encode a domain event into its persistable form.
    ///
    /// # Errors
    ///
    /// Returns the codec's error when the event cannot be serialised.
    fn encode(&self, event: &Self::Event) -> Result<PendingEvent, Self::Error>;

    /// Decode a stored event, or `None` when this codec does not recognise
    /// it.
    fn try_decode(&self, stored: &StoredEvent) -> Option<Self::Event>;
}

/// JSON codec backed by `serde_json`.
///
/// Works for any self-describing event type (typically an externally tagged
/// `serde` enum). Payloads that fail to deserialise are treated as unknown
/// events rather than errors.
#[derive(Debug)]
pub struct Json<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> Json<E> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for Json<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Json<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> EventCodec for Json<E>
where
    E: DomainEvent + Serialize + DeserializeOwned + Send + Sync,
{
    type Error = serde_json::Error;
    type Event = E;

    fn encode(&self, event: &E) -> Result<PendingEvent, serde_json::Error> {
        Ok(PendingEvent::new(event.kind(), serde_json::to_vec(event)?))
    }

    fn try_decode(&self, stored: &StoredEvent) -> Option<E> {
        serde_json::from_slice(&stored.data).ok()
    }
}

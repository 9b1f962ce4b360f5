use std::time::Instant;

use sqlx::{PgPool, Row, postgres::PgRow};
use tidemark_core::{
    metrics::{Direction, SliceMetric},
    store::{StoreError, StoredEvent},
};

use super::Store;
use crate::Error;

impl Store {
    /// Deserialise a raw Postgres row into a [`StoredEvent`].
    pub(in crate::store) fn decode_row(row: &PgRow) -> Result<StoredEvent, Error> {
        Ok(StoredEvent {
            id: row.try_get("event_id")?,
            index: row.try_get("idx")?,
            kind: row.try_get("kind")?,
            data: row.try_get("data")?,
            metadata: row.try_get("metadata")?,
        })
    }

    /// Fail fast when the stream carries a tombstone.
    pub(in crate::store) async fn ensure_not_deleted(
        &self,
        pool: &PgPool,
        stream: &str,
    ) -> Result<(), StoreError> {
        let deleted: Option<bool> = self
            .run_with_retries(|| async move {
                sqlx::query_scalar(r"SELECT deleted FROM tm_streams WHERE stream = $1")
                    .bind(stream)
                    .fetch_optional(pool)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        if deleted == Some(true) {
            return Err(StoreError::StreamDeleted {
                stream: stream.to_owned(),
            });
        }
        Ok(())
    }

    /// One forward page starting at `from_index`, retry-wrapped.
    async fn fetch_forward_page(
        &self,
        pool: &PgPool,
        stream: &str,
        from_index: i64,
        limit: usize,
        started: Instant,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self
            .run_with_retries(|| async move {
                let rows = sqlx::query(
                    r"
                    SELECT event_id, idx, kind, data, metadata
                    FROM tm_events
                    WHERE stream = $1 AND idx >= $2
                    ORDER BY idx ASC
                    LIMIT $3
                    ",
                )
                .bind(stream)
                .bind(from_index)
                .bind(limit as i64)
                .fetch_all(pool)
                .await?;
                rows.iter()
                    .map(Self::decode_row)
                    .collect::<Result<Vec<StoredEvent>, Error>>()
            })
            .await?;
        self.emit_slice(stream, &events, Direction::Forward, started);
        Ok(events)
    }

    /// One backward page ending just before `before`, retry-wrapped.
    pub(in crate::store) async fn fetch_backward_page(
        &self,
        pool: &PgPool,
        stream: &str,
        before: Option<i64>,
        limit: usize,
        started: Instant,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self
            .run_with_retries(|| async move {
                let rows = match before {
                    Some(before) => {
                        sqlx::query(
                            r"
                            SELECT event_id, idx, kind, data, metadata
                            FROM tm_events
                            WHERE stream = $1 AND idx < $2
                            ORDER BY idx DESC
                            LIMIT $3
                            ",
                        )
                        .bind(stream)
                        .bind(before)
                        .bind(limit as i64)
                        .fetch_all(pool)
                        .await?
                    }
                    None => {
                        sqlx::query(
                            r"
                            SELECT event_id, idx, kind, data, metadata
                            FROM tm_events
                            WHERE stream = $1
                            ORDER BY idx DESC
                            LIMIT $2
                            ",
                        )
                        .bind(stream)
                        .bind(limit as i64)
                        .fetch_all(pool)
                        .await?
                    }
                };
                rows.iter()
                    .map(Self::decode_row)
                    .collect::<Result<Vec<StoredEvent>, Error>>()
            })
            .await?;
        self.emit_slice(stream, &events, Direction::Backward, started);
        Ok(events)
    }

    /// Page forward from `from_index` until the stream head, observing the
    /// configured page cap. Returns the events and the page count.
    pub(in crate::store) async fn scan_forward(
        &self,
        pool: &PgPool,
        stream: &str,
        from_index: i64,
        started: Instant,
    ) -> Result<(Vec<StoredEvent>, usize), StoreError> {
        let page_limit = self.batching.batch_size.max(1);
        let mut events: Vec<StoredEvent> = Vec::new();
        let mut cursor = from_index;
        let mut batches = 0usize;

        loop {
            if let Some(max_batches) = self.batching.max_batches
                && batches >= max_batches
            {
                return Err(StoreError::BatchLimitExceeded {
                    stream: stream.to_owned(),
                    max_batches,
                });
            }
            let page = self
                .fetch_forward_page(pool, stream, cursor, page_limit, started)
                .await?;
            batches += 1;
            let page_len = page.len();
            if let Some(last) = page.last() {
                cursor = last.index + 1;
            }
            events.extend(page);
            if page_len < page_limit {
                break;
            }
        }
        Ok((events, batches))
    }

    fn emit_slice(
        &self,
        stream: &str,
        events: &[StoredEvent],
        direction: Direction,
        started: Instant,
    ) {
        self.observer.slice_read(&SliceMetric {
            stream: stream.to_owned(),
            elapsed: started.elapsed(),
            bytes: events.iter().map(|event| event.data.len()).sum(),
            count: events.len(),
            direction,
        });
    }
}

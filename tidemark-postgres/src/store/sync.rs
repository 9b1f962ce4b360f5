use nonempty::NonEmpty;
use sqlx::{Postgres, QueryBuilder, Row};
use tidemark_core::{
    store::{CompactionPredicate, PendingEvent, StoreError, SyncResult},
    token::StreamToken,
};

use super::Store;
use crate::Error;

impl Store {
    /// Append `events` inside one transaction, holding the stream row's lock
    /// across the version check.
    ///
    /// Not retried: see [`RetryPolicy`](super::RetryPolicy). A failed
    /// version check rolls the transaction back by dropping it.
    pub(in crate::store) async fn append_batch(
        &self,
        stream: &str,
        expected: &StreamToken,
        events: &NonEmpty<PendingEvent>,
        is_compaction: Option<&CompactionPredicate>,
    ) -> Result<SyncResult, StoreError> {
        let mut tx = self
            .write_pool
            .begin()
            .await
            .map_err(|e| StoreError::transport(Error::Database(e)))?;

        sqlx::query(
            r"
            INSERT INTO tm_streams (stream, last_index, deleted)
            VALUES ($1, -1, FALSE)
            ON CONFLICT (stream) DO NOTHING
            ",
        )
        .bind(stream)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::transport(Error::Database(e)))?;

        let row = sqlx::query(
            r"
            SELECT last_index, deleted
            FROM tm_streams
            WHERE stream = $1
            FOR UPDATE
            ",
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::transport(Error::Database(e)))?;

        let last_index: i64 = row
            .try_get("last_index")
            .map_err(|e| StoreError::transport(Error::Database(e)))?;
        let deleted: bool = row
            .try_get("deleted")
            .map_err(|e| StoreError::transport(Error::Database(e)))?;

        if deleted {
            return Err(StoreError::StreamDeleted {
                stream: stream.to_owned(),
            });
        }
        if last_index != expected.stream_version() {
            return Ok(SyncResult::ConflictUnknown(Some(
                StreamToken::of_uncompacted(last_index),
            )));
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO tm_events (stream, idx, event_id, kind, data, metadata) ",
        );
        qb.push_values(events.iter().enumerate(), |mut b, (offset, event)| {
            b.push_bind(stream);
            b.push_bind(expected.stream_version() + 1 + offset as i64);
            b.push_bind(event.id);
            b.push_bind(&event.kind);
            b.push_bind(&event.data);
            b.push_bind(&event.metadata);
        });
        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::transport(Error::Database(e)))?;

        let new_last_index = expected.stream_version() + events.len() as i64;
        sqlx::query(r"UPDATE tm_streams SET last_index = $1 WHERE stream = $2")
            .bind(new_last_index)
            .bind(stream)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::transport(Error::Database(e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::transport(Error::Database(e)))?;

        let kinds: Vec<&str> = events.iter().map(|event| event.kind.as_str()).collect();
        Ok(SyncResult::Written(StreamToken::after_append(
            expected,
            &kinds,
            is_compaction,
            self.batching.window(),
        )))
    }
}

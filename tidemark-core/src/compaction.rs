//! Scheduling of in-stream rolling snapshots.
//!
//! Rolling-snapshot categories keep an origin event within the last
//! `batch_size` events of the stream. Before each sync the category asks a
//! [`CompactionContext`] whether the batch about to be written would push the
//! stream past its remaining headroom; if so, a snapshot event rides along in
//! the same append.

/// Decision input for one sync under a rolling-snapshot strategy.
#[derive(Clone, Copy, Debug)]
pub struct CompactionContext {
    events_len: usize,
    capacity_before_compaction: i64,
}

impl CompactionContext {
    /// `events_len` is the batch about to be written;
    /// `capacity_before_compaction` is the token's remaining headroom.
    #[must_use]
    pub const fn new(events_len: usize, capacity_before_compaction: i64) -> Self {
        Self {
            events_len,
            capacity_before_compaction,
        }
    }

    /// Whether this sync must carry a snapshot to preserve the invariant.
    #[must_use]
    pub fn is_compaction_due(&self) -> bool {
        self.events_len as i64 > self.capacity_before_compaction
    }
}

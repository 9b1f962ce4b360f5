//! Structured store instrumentation.
//!
//! Stores emit one record per slice read, one rollup per completed scan, and
//! one record per write outcome. The records go to a [`StoreObserver`] that
//! the host wires to its telemetry; nothing here is process-global. The
//! default [`TracingObserver`] forwards everything as `tracing` events.

use std::time::Duration;

/// Scan direction of a read operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Backward,
}

/// One page fetched from the backend.
#[derive(Clone, Debug)]
pub struct SliceMetric {
    pub stream: String,
    pub elapsed: Duration,
    pub bytes: usize,
    pub count: usize,
    pub direction: Direction,
}

/// Rollup for a completed multi-page scan.
#[derive(Clone, Debug)]
pub struct BatchMetric {
    pub stream: String,
    pub elapsed: Duration,
    pub batches: usize,
    pub count: usize,
    pub direction: Direction,
}

/// Outcome of an append attempt.
#[derive(Clone, Debug)]
pub struct WriteMetric {
    pub stream: String,
    pub elapsed: Duration,
    pub bytes: usize,
    pub count: usize,
}

/// Receiver for store metrics.
///
/// All hooks default to no-ops so observers only implement what they need.
pub trait StoreObserver: Send + Sync {
    fn slice_read(&self, metric: &SliceMetric) {
        let _ = metric;
    }

    fn batch_read(&self, metric: &BatchMetric) {
        let _ = metric;
    }

    fn sync_succeeded(&self, metric: &WriteMetric) {
        let _ = metric;
    }

    fn sync_conflicted(&self, metric: &WriteMetric) {
        let _ = metric;
    }
}

/// Observer that forwards every record as a `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl StoreObserver for TracingObserver {
    fn slice_read(&self, metric: &SliceMetric) {
        tracing::debug!(
            stream = %metric.stream,
            count = metric.count,
            bytes = metric.bytes,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            direction = ?metric.direction,
            "slice read"
        );
    }

    fn batch_read(&self, metric: &BatchMetric) {
        tracing::debug!(
            stream = %metric.stream,
            count = metric.count,
            batches = metric.batches,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            direction = ?metric.direction,
            "batch read"
        );
    }

    fn sync_succeeded(&self, metric: &WriteMetric) {
        tracing::debug!(
            stream = %metric.stream,
            count = metric.count,
            bytes = metric.bytes,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            "sync succeeded"
        );
    }

    fn sync_conflicted(&self, metric: &WriteMetric) {
        tracing::debug!(
            stream = %metric.stream,
            count = metric.count,
            bytes = metric.bytes,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            "sync conflicted"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        slices: AtomicUsize,
    }

    impl StoreObserver for Counting {
        fn slice_read(&self, _metric: &SliceMetric) {
            self.slices.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unimplemented_hooks_are_no_ops() {
        let observer = Counting::default();
        let write = WriteMetric {
            stream: "Counter-1".to_owned(),
            elapsed: Duration::ZERO,
            bytes: 0,
            count: 1,
        };
        observer.sync_succeeded(&write);
        observer.sync_conflicted(&write);
        observer.slice_read(&SliceMetric {
            stream: "Counter-1".to_owned(),
            elapsed: Duration::ZERO,
            bytes: 12,
            count: 1,
            direction: Direction::Forward,
        });
        assert_eq!(observer.slices.load(Ordering::SeqCst), 1);
    }
}

//! Timing statistics

use std::collections::BTreeMap;
use std::time::Duration;

/// Count of frames sent per bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketHistogram {
    counts: BTreeMap<usize, u64>,
}

impl BucketHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame in `bucket`
    pub fn record(&mut self, bucket: usize) {
        *self.counts.entry(bucket).or_insert(0) += 1;
    }

    /// Frames recorded for `bucket`
    pub fn count(&self, bucket: usize) -> u64 {
        self.counts.get(&bucket).copied().unwrap_or(0)
    }

    /// Total frames recorded
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate `(bucket, count)` in bucket order
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.counts.iter().map(|(b, c)| (*b, *c))
    }

    /// Bucket with the most frames
    pub fn most_common(&self) -> Option<usize> {
        self.counts
            .iter()
            .max_by_key(|(bucket, count)| (**count, std::cmp::Reverse(**bucket)))
            .map(|(bucket, _)| *bucket)
    }
}

/// Counters kept by the transmission scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Frames accepted into the queue
    pub enqueued: u64,
    /// Frames handed to the wire
    pub released: u64,
    /// Queued dummies evicted to make room for real frames
    pub dummies_displaced: u64,
    /// New dummies refused because the queue was full
    pub dummies_discarded: u64,
    /// Dummies dropped at release because their deadline passed
    pub dummies_expired: u64,
    /// Real frames refused with backpressure
    pub backpressure: u64,
    /// Fixed-interval slots filled with generated cover
    pub fill_ticks: u64,
    /// Fixed-interval slots left silent
    pub idle_ticks: u64,
    /// Deepest the queue has been
    pub max_depth: usize,
}

/// Observed delays between enqueue and release
#[derive(Debug, Clone, Default)]
pub struct DelayStats {
    samples: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl DelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delay sample
    pub fn record(&mut self, delay: Duration) {
        self.samples += 1;
        self.total += delay;
        self.min = Some(self.min.map_or(delay, |m| m.min(delay)));
        self.max = self.max.max(delay);
    }

    /// Get average delay
    pub fn average(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        self.total / self.samples as u32
    }

    pub fn min(&self) -> Duration {
        self.min.unwrap_or(Duration::ZERO)
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let mut hist = BucketHistogram::new();
        assert!(hist.most_common().is_none());

        hist.record(256);
        hist.record(512);
        hist.record(512);
        assert_eq!(hist.count(512), 2);
        assert_eq!(hist.count(1400), 0);
        assert_eq!(hist.total(), 3);
        assert_eq!(hist.most_common(), Some(512));

        // Ties go to the smaller bucket
        hist.record(256);
        assert_eq!(hist.most_common(), Some(256));
    }

    #[test]
    fn test_delay_stats() {
        let mut stats = DelayStats::new();
        assert_eq!(stats.average(), Duration::ZERO);

        stats.record(Duration::from_millis(100));
        stats.record(Duration::from_millis(300));
        assert_eq!(stats.average(), Duration::from_millis(200));
        assert_eq!(stats.min(), Duration::from_millis(100));
        assert_eq!(stats.max(), Duration::from_millis(300));
        assert_eq!(stats.samples(), 2);
    }
}

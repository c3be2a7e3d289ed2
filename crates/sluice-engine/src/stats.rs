//! Per-kernel batch timing.

use std::time::Duration;

/// Accumulated processing latency across batches.
///
/// Diagnostics only; nothing in the pipeline branches on these values.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    batches: u64,
    total: Duration,
}

impl BatchStats {
    /// Record one batch's device time.
    pub fn record(&mut self, elapsed: Duration) {
        self.batches += 1;
        self.total += elapsed;
    }

    /// Number of recorded batches.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Mean device time per batch, in milliseconds.
    pub fn average_batch_ms(&self) -> f64 {
        if self.batches == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1_000.0 / self.batches as f64
    }

    /// Mean device time per event, in milliseconds, for a nominal batch
    /// size.
    pub fn average_per_event_ms(&self, batch_size: usize) -> f64 {
        if batch_size == 0 {
            return 0.0;
        }
        self.average_batch_ms() / batch_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages() {
        let mut stats = BatchStats::default();
        assert_eq!(stats.average_batch_ms(), 0.0);

        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));
        assert_eq!(stats.batches(), 2);
        let avg = stats.average_batch_ms();
        assert!((avg - 15.0).abs() < 1e-9);
        assert!((stats.average_per_event_ms(100) - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_zero_batch_size_is_defined() {
        let mut stats = BatchStats::default();
        stats.record(Duration::from_millis(5));
        assert_eq!(stats.average_per_event_ms(0), 0.0);
    }
}

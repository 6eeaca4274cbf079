//! Per-batch latency accounting.

use getset::Getters;

/// Running cycle statistics over the posted batches of a run.
///
/// Only batches of the nominal (full) size contribute to min/max and to the
/// sample count; every batch, full or partial, contributes to the running
/// total so the per-message average includes partial-batch overhead.
#[derive(Debug, Clone, Copy, Getters)]
#[getset(get = "pub")]
pub struct LatencyStats {
    /// Number of full-size batches sampled
    batch_samples: u32,
    /// Smallest full-batch cycle delta
    min: u64,
    /// Largest full-batch cycle delta
    max: u64,
    /// Sum of all batch deltas, full and partial
    tot: u64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Fresh accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            batch_samples: 0,
            min: u64::MAX,
            max: 0,
            tot: 0,
        }
    }

    /// Record the cycle delta of one posted batch.
    pub fn record(&mut self, full_batch: bool, delta: u64) {
        self.tot = self.tot.saturating_add(delta);
        if full_batch {
            self.min = self.min.min(delta);
            self.max = self.max.max(delta);
            self.batch_samples = self.batch_samples.saturating_add(1);
        }
    }

    /// Convert the raw cycle counts into a wall-clock report.
    ///
    /// The average divides the accumulated total by the iteration count, not
    /// by the batch count: the result is the amortized cost per message.
    #[must_use]
    pub fn report(&self, iterations: u32, cycles_per_nsec: f64) -> LatencyReport {
        #[allow(clippy::cast_precision_loss)]
        let to_ns = |cycles: u64| -> f64 { cycles as f64 / cycles_per_nsec };
        let (min_ns, max_ns) = if self.batch_samples == 0 {
            (0.0, 0.0)
        } else {
            (to_ns(self.min), to_ns(self.max))
        };
        #[allow(clippy::cast_precision_loss)]
        let avg_message_ns = if iterations == 0 {
            0.0
        } else {
            to_ns(self.tot) / f64::from(iterations)
        };
        LatencyReport {
            batch_samples: self.batch_samples,
            min_batch_ns: min_ns,
            max_batch_ns: max_ns,
            avg_message_ns,
        }
    }
}

/// Final human-readable latency figures.
#[derive(Debug, Clone, Copy, Getters)]
#[getset(get = "pub")]
pub struct LatencyReport {
    /// Number of full-size batches that entered min/max
    batch_samples: u32,
    /// Fastest full batch
    min_batch_ns: f64,
    /// Slowest full batch
    max_batch_ns: f64,
    /// Amortized per-message cost over the whole run
    avg_message_ns: f64,
}

impl std::fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "samples={} min_batch={:.1}ns max_batch={:.1}ns avg_per_message={:.1}ns",
            self.batch_samples, self.min_batch_ns, self.max_batch_ns, self.avg_message_ns
        )
    }
}

#[cfg(test)]
mod tests {
    use super::LatencyStats;

    #[test]
    fn scripted_deltas() {
        // first three batches are full-size, the last two are partial
        let deltas = [40_u64, 10, 30, 7, 3];
        let mut stats = LatencyStats::new();
        for (i, delta) in deltas.iter().enumerate() {
            stats.record(i < 3, *delta);
        }
        assert_eq!(*stats.batch_samples(), 3);
        assert_eq!(*stats.min(), 10);
        assert_eq!(*stats.max(), 40);
        assert_eq!(*stats.tot(), 90);
    }

    #[test]
    fn average_divides_by_iterations() {
        let mut stats = LatencyStats::new();
        stats.record(true, 600);
        stats.record(false, 400);
        // 10 messages over 1000 cycles at 2 cycles/ns => 50 ns per message
        let report = stats.report(10, 2.0);
        assert!((report.avg_message_ns() - 50.0).abs() < f64::EPSILON);
        assert_eq!(*report.batch_samples(), 1);
    }

    #[test]
    fn empty_run_reports_zeroes() {
        let report = LatencyStats::new().report(0, 1.0);
        assert_eq!(*report.batch_samples(), 0);
        assert!((report.min_batch_ns() - 0.0).abs() < f64::EPSILON);
        assert!((report.avg_message_ns() - 0.0).abs() < f64::EPSILON);
    }
}

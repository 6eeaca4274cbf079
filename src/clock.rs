//! Monotonic cycle counter and frequency calibration.
//!
//! The latency sampler works on raw cycle deltas; conversion to wall-clock
//! time happens once, at report time, through a calibrated cycles-per-
//! nanosecond ratio.

use std::time::{Duration, Instant};

/// Read the CPU cycle counter.
#[inline]
#[must_use]
pub fn read_cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: reading the TSC has no side effects
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Calibration window; long enough for a stable ratio, short enough to not
/// delay the run noticeably.
const CALIBRATION_WINDOW: Duration = Duration::from_millis(20);

/// Measure the cycle counter frequency against the wall clock and return the
/// cycles-per-nanosecond ratio.
#[must_use]
pub fn cycles_per_nsec() -> f64 {
    let wall_start = Instant::now();
    let cycles_start = read_cycles();
    while wall_start.elapsed() < CALIBRATION_WINDOW {
        std::hint::spin_loop();
    }
    let cycles_end = read_cycles();
    let elapsed_nanos = wall_start.elapsed().as_nanos();
    debug_assert!(elapsed_nanos > 0, "zero-length calibration window");
    #[allow(clippy::cast_precision_loss)]
    {
        (cycles_end.wrapping_sub(cycles_start)) as f64 / elapsed_nanos as f64
    }
}

#[cfg(test)]
mod tests {
    use super::{cycles_per_nsec, read_cycles};

    #[test]
    fn cycles_advance() {
        let c0 = read_cycles();
        // burn a little time so the counter visibly moves
        let mut acc = 0_u64;
        for i in 0..10_000_u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);
        let c1 = read_cycles();
        assert!(c1 > c0);
    }

    #[test]
    fn calibration_is_positive() {
        let ratio = cycles_per_nsec();
        assert!(ratio > 0.0);
        // modern CPUs run somewhere between ~0.5 and ~6 GHz
        assert!(ratio < 100.0);
    }
}

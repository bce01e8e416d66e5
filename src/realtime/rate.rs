//! Sample rate refinement from contiguous runs of blocks
//!
//! Nominal rates are rarely exact. The estimator stitches incoming blocks
//! into a contiguous run and, once the run covers enough time, measures the
//! true rate as `samples / elapsed`.

/// Shortest run, in microseconds, precise enough to measure a rate from
const MIN_RUN_MICROS: i64 = 60_000_000;

/// Relative difference below which the measured rate snaps to nominal
const SNAP_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    start: i64,
    end: i64,
    nsamp: u64,
}

impl Run {
    fn covered(&self) -> i64 {
        self.end - self.start
    }
}

/// Per-channel rate estimator, all times in epoch microseconds
#[derive(Debug, Clone)]
pub struct RateEstimator {
    nominal: f64,
    duration_micros: i64,
    run: Option<Run>,
    best_rate: Option<f64>,
    best_nsamp: u64,
    updates: u64,
}

impl RateEstimator {
    pub fn new(nominal: f64, duration_secs: f64) -> Self {
        Self {
            nominal,
            duration_micros: (duration_secs * 1_000_000.0).round() as i64,
            run: None,
            best_rate: None,
            best_nsamp: 0,
            updates: 0,
        }
    }

    pub fn nominal(&self) -> f64 {
        self.nominal
    }

    /// Number of times a best rate was computed
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Samples in the run being accumulated
    pub fn run_nsamp(&self) -> u64 {
        self.run.map(|r| r.nsamp).unwrap_or(0)
    }

    /// Feed one block; returns true exactly when the best rate was just updated
    pub fn submit(&mut self, start_micros: i64, nsamp: usize) -> bool {
        if self.nominal <= 0.0 || nsamp == 0 {
            return false;
        }
        let period = 1_000_000.0 / self.nominal;
        let half = (period / 2.0) as i64;
        let end_micros = start_micros + (nsamp as f64 * period).round() as i64;
        let block = Run {
            start: start_micros,
            end: end_micros,
            nsamp: nsamp as u64,
        };

        let Some(mut run) = self.run else {
            self.run = Some(block);
            return false;
        };

        if (start_micros - run.end).abs() <= half {
            run.end = end_micros;
            run.nsamp += block.nsamp;
        } else if (end_micros - run.start).abs() <= half {
            run.start = start_micros;
            run.nsamp += block.nsamp;
        } else {
            // Discontinuity: keep the old run's measurement if it earned one
            let old_enough = run.covered() >= self.duration_micros / 4;
            let updated = if run.nsamp >= self.best_nsamp || old_enough {
                self.do_best_rate(&run)
            } else {
                tracing::trace!(nsamp = run.nsamp, "Discarding short rate run");
                false
            };
            self.run = Some(block);
            return updated;
        }

        let limit = 4.0 * self.duration_micros as f64 / 1_000_000.0 * self.nominal;
        if run.nsamp as f64 > limit {
            let updated = self.do_best_rate(&run);
            self.run = Some(block);
            return updated;
        }

        self.run = Some(run);
        false
    }

    /// Measure the rate of `run`; runs under a minute are refused
    fn do_best_rate(&mut self, run: &Run) -> bool {
        if run.covered() < MIN_RUN_MICROS {
            return false;
        }
        let rate = round_significant(run.nsamp as f64 / (run.covered() as f64 / 1_000_000.0), 10);
        self.best_rate = Some(rate);
        self.best_nsamp = run.nsamp;
        self.updates += 1;
        tracing::trace!(rate, nsamp = run.nsamp, "Best rate updated");
        true
    }

    /// Refined rate, or nominal when none has been measured or it is within noise
    pub fn best_rate(&self) -> f64 {
        match self.best_rate {
            Some(rate) if ((rate - self.nominal) / self.nominal).abs() >= SNAP_TOLERANCE => rate,
            _ => self.nominal,
        }
    }
}

fn round_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let scale = 10f64.powi(digits - 1 - magnitude);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_390_219_200_000_000;
    const SEC: i64 = 1_000_000;

    fn feed(est: &mut RateEstimator, start: i64, blocks: usize, block_secs: i64, rate: f64) -> bool {
        let mut updated = false;
        for i in 0..blocks {
            let nsamp = (block_secs as f64 * rate) as usize;
            updated |= est.submit(start + i as i64 * block_secs * SEC, nsamp);
        }
        updated
    }

    #[test]
    fn test_contiguous_blocks_extend_run() {
        let mut est = RateEstimator::new(40.0, 3600.0);
        assert!(!feed(&mut est, T0, 10, 1, 40.0));
        assert_eq!(est.run_nsamp(), 400);

        // Out of order: a block that ends where the run starts
        assert!(!est.submit(T0 - SEC, 40));
        assert_eq!(est.run_nsamp(), 440);
    }

    #[test]
    fn test_short_run_never_updates() {
        let mut est = RateEstimator::new(40.0, 3600.0);
        feed(&mut est, T0, 59, 1, 40.0);
        // Gap forces a commit attempt of a 59 s run
        assert!(!est.submit(T0 + 3600 * SEC, 40));
        assert_eq!(est.updates(), 0);
        assert_eq!(est.best_rate(), 40.0);
    }

    #[test]
    fn test_measured_rate_from_run() {
        // 120 s of timestamps holding 4812 samples: the digitizer runs at 40.1 Hz
        let mut est = RateEstimator::new(40.0, 3600.0);
        let run = Run {
            start: T0,
            end: T0 + 120 * SEC,
            nsamp: 4812,
        };
        assert!(est.do_best_rate(&run));
        assert!((est.best_rate() - 40.1).abs() < 1e-9);
    }

    #[test]
    fn test_snap_to_nominal() {
        let mut est = RateEstimator::new(40.0, 3600.0);
        assert!(!feed(&mut est, T0, 70, 1, 40.0));
        assert!(est.submit(T0 + 7200 * SEC, 40));
        assert_eq!(est.updates(), 1);
        assert_eq!(est.best_rate(), 40.0);
    }

    #[test]
    fn test_force_commit_of_long_run() {
        // 100 s buffer: limit is 4 * 100 * 40 = 16000 samples
        let mut est = RateEstimator::new(40.0, 100.0);
        let updated = feed(&mut est, T0, 401, 1, 40.0);
        assert!(updated);
        assert!(est.run_nsamp() <= 40);
    }

    #[test]
    fn test_round_significant() {
        assert_eq!(round_significant(40.000000000123, 10), 40.0);
        assert_eq!(round_significant(123.456789012345, 10), 123.456789);
        assert_eq!(round_significant(0.0, 10), 0.0);
    }
}

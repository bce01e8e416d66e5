//! Sparse offset ↔ time anchors for a realtime buffer
//!
//! Projecting `start + i / rate` over millions of samples accumulates error,
//! and real digitizers drift from their nominal rate. The buffer therefore
//! records actual `(offset, time)` pairs as data arrives and projects from the
//! nearest one, so the error never exceeds one inter-anchor interval.
//!
//! ```text
//! offset:  0 ─────── 400 ─────────── 812 ──────── capacity
//!          │          │               │
//! time:   t0        t0+10.001s      t0+20.3s
//! ```

/// One recorded `(sample offset, wall-clock ms)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub offset: i64,
    pub time: i64,
}

/// Ordered anchors, strictly increasing in both offset and time
#[derive(Debug, Clone)]
pub struct TimeAnchorIndex {
    anchors: Vec<Anchor>,
    rate: f64,
    duration_ms: i64,
    min_time_diff: i64,
}

impl TimeAnchorIndex {
    /// Rate change beyond which existing anchors are considered stale
    const RATE_CHANGE_LIMIT: f64 = 0.10;

    pub fn new(rate: f64, duration_secs: f64) -> Self {
        let duration_ms = (duration_secs * 1000.0).round() as i64;
        Self {
            anchors: Vec::new(),
            rate,
            duration_ms,
            min_time_diff: min_time_diff(rate, duration_ms),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Minimum spacing between anchors, ms
    pub fn min_time_diff(&self) -> i64 {
        self.min_time_diff
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn clear(&mut self) {
        self.anchors.clear();
    }

    /// Record an anchor if it is far enough from every existing one and keeps
    /// the list ordered; returns whether it was inserted
    pub fn add_time(&mut self, offset: i64, time: i64) -> bool {
        if let Some(nearest) = self.nearest(time) {
            if (time - nearest.time).abs() < self.min_time_diff {
                return false;
            }
        }

        let pos = self.anchors.partition_point(|a| a.offset < offset);
        let before_ok = pos == 0 || {
            let prev = self.anchors[pos - 1];
            prev.offset < offset && prev.time < time
        };
        let after_ok = pos == self.anchors.len() || {
            let next = self.anchors[pos];
            next.offset > offset && next.time > time
        };
        if !(before_ok && after_ok) {
            tracing::trace!(offset, time, "Anchor out of order, ignored");
            return false;
        }

        self.anchors.insert(pos, Anchor { offset, time });
        true
    }

    /// Sample offset holding time `t`, projected from the nearest anchor
    pub fn index_of_time(&self, t: i64) -> Option<i64> {
        if self.rate <= 0.0 {
            return None;
        }
        let anchor = self.nearest(t)?;
        let samples = (t - anchor.time) as f64 / 1000.0 * self.rate;
        Some(anchor.offset + samples.round() as i64)
    }

    /// Wall-clock time of sample `offset`
    pub fn time_at_index(&self, offset: i64) -> Option<i64> {
        if self.rate <= 0.0 {
            return None;
        }
        let pos = self.anchors.partition_point(|a| a.offset <= offset);
        let anchor = if pos == 0 {
            self.anchors.first()?
        } else {
            &self.anchors[pos - 1]
        };
        let millis = (offset - anchor.offset) as f64 / self.rate * 1000.0;
        Some(anchor.time + millis.round() as i64)
    }

    /// Drop anchors older than `cutoff` and rebase the rest by `shift` samples
    pub fn trim(&mut self, cutoff: i64, shift: i64) {
        self.anchors.retain(|a| a.time >= cutoff);
        for anchor in &mut self.anchors {
            anchor.offset -= shift;
        }
    }

    /// Change the projection rate; returns true when the anchors were cleared
    pub fn set_rate(&mut self, rate: f64) -> bool {
        let stale = self.rate > 0.0 && ((rate - self.rate) / self.rate).abs() > Self::RATE_CHANGE_LIMIT;
        if stale {
            tracing::debug!(old = self.rate, new = rate, "Rate changed sharply, clearing anchors");
            self.anchors.clear();
        }
        self.rate = rate;
        self.min_time_diff = min_time_diff(rate, self.duration_ms);
        stale
    }

    /// Bytes held by the anchor list
    pub fn memory_usage(&self) -> usize {
        self.anchors.capacity() * std::mem::size_of::<Anchor>()
    }

    /// Anchor closest in time to `t`; ties go to the lower offset
    fn nearest(&self, t: i64) -> Option<&Anchor> {
        let mut best: Option<&Anchor> = None;
        for anchor in &self.anchors {
            let closer = match best {
                None => true,
                Some(b) => (t - anchor.time).abs() < (t - b.time).abs(),
            };
            if closer {
                best = Some(anchor);
            }
        }
        best
    }
}

/// 400000 / rate ms (one anchor per 400000 samples' worth of ms), capped at duration / 8
fn min_time_diff(rate: f64, duration_ms: i64) -> i64 {
    let cap = duration_ms / 8;
    if rate <= 0.0 {
        return cap;
    }
    ((400_000.0 / rate) as i64).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_390_219_200_000;

    #[test]
    fn test_min_time_diff_bounds() {
        assert_eq!(TimeAnchorIndex::new(40.0, 3600.0).min_time_diff(), 10_000);
        assert_eq!(TimeAnchorIndex::new(1.0, 3600.0).min_time_diff(), 400_000);
        // Very low rates are capped at an eighth of the buffer
        assert_eq!(TimeAnchorIndex::new(0.1, 3600.0).min_time_diff(), 450_000);
        assert_eq!(TimeAnchorIndex::new(1000.0, 3600.0).min_time_diff(), 400);
    }

    #[test]
    fn test_add_time_spacing_and_order() {
        let mut idx = TimeAnchorIndex::new(40.0, 3600.0);
        assert!(idx.add_time(0, T0));
        assert!(!idx.add_time(40, T0 + 1000)); // too close
        assert!(idx.add_time(400, T0 + 10_000));
        // Later offset but earlier time breaks ordering
        assert!(!idx.add_time(2000, T0 - 20_000));
        assert!(idx.add_time(2000, T0 + 50_000));
        assert_eq!(idx.len(), 3);

        let offsets: Vec<i64> = idx.anchors().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 400, 2000]);
    }

    #[test]
    fn test_projection_uses_nearest_anchor() {
        let mut idx = TimeAnchorIndex::new(40.0, 3600.0);
        idx.add_time(0, T0);
        // The digitizer actually ran slightly fast: 4000 samples in 99.9 s
        idx.add_time(4000, T0 + 99_900);

        assert_eq!(idx.index_of_time(T0 + 1000), Some(40));
        assert_eq!(idx.index_of_time(T0 + 99_900 + 1000), Some(4040));
        assert_eq!(idx.time_at_index(4040), Some(T0 + 99_900 + 1000));
        assert_eq!(idx.time_at_index(3999), Some(T0 + 99_975));
        // Before the first anchor projects backward from it
        assert_eq!(idx.time_at_index(-40), Some(T0 - 1000));
    }

    #[test]
    fn test_tie_goes_to_lower_offset() {
        let mut idx = TimeAnchorIndex::new(40.0, 3600.0);
        idx.add_time(0, T0);
        idx.add_time(1000, T0 + 20_000);
        // Equidistant: projected from offset 0 gives 400, from 1000 gives 600
        assert_eq!(idx.index_of_time(T0 + 10_000), Some(400));
    }

    #[test]
    fn test_round_trip_within_one_sample() {
        for rate in [0.1, 1.0, 20.0, 40.0, 100.0, 1000.0] {
            let mut idx = TimeAnchorIndex::new(rate, 3600.0);
            idx.add_time(0, T0);
            idx.add_time((rate * 1200.0).round() as i64, T0 + 1_200_000);
            let period = 1000.0 / rate;
            for dt in [0i64, 7, 999, 123_457, 1_199_999, 2_000_001, 3_599_000] {
                let t = T0 + dt;
                let i = idx.index_of_time(t).unwrap();
                let back = idx.time_at_index(i).unwrap();
                assert!(
                    ((back - t).abs() as f64) <= period,
                    "rate {} t {} back {}",
                    rate,
                    t,
                    back
                );
            }
        }
    }

    #[test]
    fn test_trim_rebases() {
        let mut idx = TimeAnchorIndex::new(40.0, 3600.0);
        idx.add_time(0, T0);
        idx.add_time(400, T0 + 10_000);
        idx.add_time(800, T0 + 20_000);
        idx.trim(T0 + 10_000, 400);
        assert_eq!(
            idx.anchors(),
            &[
                Anchor { offset: 0, time: T0 + 10_000 },
                Anchor { offset: 400, time: T0 + 20_000 }
            ]
        );
    }

    #[test]
    fn test_set_rate_clears_on_large_change() {
        let mut idx = TimeAnchorIndex::new(40.0, 3600.0);
        idx.add_time(0, T0);
        assert!(!idx.set_rate(40.001));
        assert_eq!(idx.len(), 1);
        assert!(idx.set_rate(50.0));
        assert!(idx.is_empty());
        assert!(idx.index_of_time(T0).is_none());
    }

    #[test]
    fn test_empty_index_projects_nothing() {
        let idx = TimeAnchorIndex::new(40.0, 3600.0);
        assert!(idx.index_of_time(T0).is_none());
        assert!(idx.time_at_index(0).is_none());
    }
}

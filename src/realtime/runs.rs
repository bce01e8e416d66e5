//! Intervals of a realtime buffer that hold real data

/// A `[start, end)` wall-clock interval in epoch ms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: i64,
    pub end: i64,
}

/// Data intervals, merged and sorted lazily
#[derive(Debug, Clone)]
pub struct RunList {
    runs: Vec<Run>,
    /// Intervals closer than this are merged, ms
    tolerance: i64,
    sorted: bool,
}

impl RunList {
    /// Run list for a channel sampled at `rate`; gaps under half a sample merge
    pub fn new(rate: f64) -> Self {
        Self {
            runs: Vec::new(),
            tolerance: tolerance_for(rate),
            sorted: true,
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.tolerance = tolerance_for(rate);
    }

    pub fn add(&mut self, start: i64, end: i64) {
        if end <= start {
            return;
        }
        if let Some(last) = self.runs.last_mut() {
            if start >= last.start && start <= last.end + self.tolerance {
                last.end = last.end.max(end);
                return;
            }
            if start < last.start {
                self.sorted = false;
            }
        }
        self.runs.push(Run { start, end });
    }

    /// Sort and merge overlapping or touching runs
    pub fn consolidate(&mut self) {
        if !self.sorted {
            self.runs.sort_by_key(|r| r.start);
            self.sorted = true;
        }
        let mut merged: Vec<Run> = Vec::with_capacity(self.runs.len());
        for run in self.runs.drain(..) {
            match merged.last_mut() {
                Some(last) if run.start <= last.end + self.tolerance => {
                    last.end = last.end.max(run.end);
                }
                _ => merged.push(run),
            }
        }
        self.runs = merged;
    }

    /// Forget data before `cutoff`
    pub fn trim(&mut self, cutoff: i64) {
        self.runs.retain(|r| r.end > cutoff);
        for run in &mut self.runs {
            run.start = run.start.max(cutoff);
        }
    }

    pub fn clear(&mut self) {
        self.runs.clear();
        self.sorted = true;
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.runs.capacity() * std::mem::size_of::<Run>()
    }
}

fn tolerance_for(rate: f64) -> i64 {
    if rate > 0.0 {
        ((500.0 / rate).round() as i64).max(1)
    } else {
        1
    }
}

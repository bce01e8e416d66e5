//! Duplicate-suppressing result array
//!
//! Some stores hold the same record more than once (re-sent telemetry,
//! merged archives). When a client asks for de-duplicated output, records
//! are collected here instead of being streamed.
//!
//! Until the array holds `duration / 100 * rate` entries every record is
//! appended. Past that point a record is appended when its start time beats
//! the running maximum, or when it differs byte for byte from the last two
//! entries of the same channel.

use crate::query::engine::RecordSink;
use crate::query::error::QueryResult;
use crate::storage::mseed::RecordHeader;
use crate::storage::types::SeedName;

/// Same-channel entries compared against a candidate
const LOOKBACK: usize = 2;

/// One collected record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub channel: SeedName,
    pub start_micros: i64,
    pub bytes: Vec<u8>,
}

pub struct ResultArraySink {
    duration_secs: f64,
    threshold: Option<f64>,
    entries: Vec<ResultEntry>,
    running_max: i64,
    suppressed: usize,
}

impl ResultArraySink {
    /// Threshold taken from the first record's rate
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            threshold: None,
            entries: Vec::new(),
            running_max: i64::MIN,
            suppressed: 0,
        }
    }

    /// Threshold fixed up front
    pub fn with_rate(duration_secs: f64, rate: f64) -> Self {
        let mut sink = Self::new(duration_secs);
        sink.threshold = Some(duration_secs / 100.0 * rate);
        sink
    }

    /// Append or suppress one record; returns whether it was kept
    pub fn push(&mut self, channel: &SeedName, start_micros: i64, rate: f64, bytes: &[u8]) -> bool {
        let duration_secs = self.duration_secs;
        let threshold = *self
            .threshold
            .get_or_insert_with(|| duration_secs / 100.0 * rate);

        if (self.entries.len() as f64) < threshold {
            self.append(channel, start_micros, bytes);
            return true;
        }

        if start_micros > self.running_max {
            self.running_max = start_micros;
            self.append(channel, start_micros, bytes);
            return true;
        }

        let duplicate = self
            .entries
            .iter()
            .rev()
            .filter(|e| &e.channel == channel)
            .take(LOOKBACK)
            .any(|e| e.bytes == bytes);
        if duplicate {
            self.suppressed += 1;
            tracing::trace!(channel = %channel, start_micros, "Duplicate record suppressed");
            return false;
        }
        self.append(channel, start_micros, bytes);
        true
    }

    fn append(&mut self, channel: &SeedName, start_micros: i64, bytes: &[u8]) {
        self.entries.push(ResultEntry {
            channel: channel.clone(),
            start_micros,
            bytes: bytes.to_vec(),
        });
    }

    pub fn entries(&self) -> &[ResultEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records dropped as duplicates so far
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    pub fn into_entries(self) -> Vec<ResultEntry> {
        self.entries
    }
}

impl RecordSink for ResultArraySink {
    fn record(&mut self, header: &RecordHeader, bytes: &[u8]) -> QueryResult<()> {
        self.push(&header.seed_name, header.start_micros, header.rate, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mseed::RecordBuilder;

    // 2014-01-20 12:00:00 UTC, in microseconds
    const T0: i64 = 1_390_219_200_000_000;

    fn record(name: &str, start: i64, fill: i32) -> (RecordHeader, Vec<u8>) {
        let bytes = RecordBuilder::new(SeedName::new(name), start, 40.0)
            .build(&[fill; 50])
            .unwrap();
        (RecordHeader::parse(&bytes).unwrap(), bytes)
    }

    #[test]
    fn test_below_threshold_keeps_duplicates() {
        // 5 s at 40 Hz: threshold of 2 entries
        let mut sink = ResultArraySink::new(5.0);
        let (header, bytes) = record("USDUG  BHZ00", T0, 7);

        sink.record(&header, &bytes).unwrap();
        sink.record(&header, &bytes).unwrap();
        assert_eq!(sink.len(), 2);

        // Past the threshold: the first repeat is new to the running maximum
        sink.record(&header, &bytes).unwrap();
        assert_eq!(sink.len(), 3);

        // ...after which exact repeats are dropped
        sink.record(&header, &bytes).unwrap();
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.suppressed(), 1);
    }

    #[test]
    fn test_newer_records_always_kept() {
        let mut sink = ResultArraySink::with_rate(1.0, 40.0);
        for i in 0..20 {
            let (header, bytes) = record("USDUG  BHZ00", T0 + i * 1_250_000, 1);
            assert!(sink.push(&header.seed_name, header.start_micros, header.rate, &bytes));
        }
        assert_eq!(sink.len(), 20);
        assert_eq!(sink.suppressed(), 0);
    }

    #[test]
    fn test_lookback_is_per_channel_and_bounded() {
        let mut sink = ResultArraySink::with_rate(0.0, 40.0);
        let (a, a_bytes) = record("USDUG  BHZ00", T0 + 10_000_000, 1);
        let (b, b_bytes) = record("USDUG  BHN00", T0 + 10_000_000, 2);
        let (old, old_bytes) = record("USDUG  BHZ00", T0, 3);
        let (mid, mid_bytes) = record("USDUG  BHZ00", T0 + 1_000_000, 4);

        sink.record(&a, &a_bytes).unwrap();
        sink.record(&b, &b_bytes).unwrap(); // same start, not above the maximum
        sink.record(&old, &old_bytes).unwrap();
        sink.record(&mid, &mid_bytes).unwrap();
        assert_eq!(sink.len(), 4);

        // `a` is now third-most-recent for its channel, outside the lookback
        sink.record(&a, &a_bytes).unwrap();
        assert_eq!(sink.len(), 5);

        // `mid` is within the last two
        sink.record(&mid, &mid_bytes).unwrap();
        assert_eq!(sink.len(), 5);

        let channels: Vec<&str> = sink.entries().iter().map(|e| e.channel.as_str()).collect();
        assert_eq!(channels[1], "USDUG  BHN00");
    }
}

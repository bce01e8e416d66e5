//! Channel → realtime span table
//!
//! The map lock is held only to look up or insert a span; all span work
//! happens under that span's own lock, so ingest for different channels
//! runs in parallel.

use crate::config::RealtimeConfig;
use crate::realtime::block::TimeSeriesBlock;
use crate::realtime::span::RealtimeSpan;
use crate::storage::codec::SampleCodec;
use crate::storage::types::SeedName;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SharedSpan = Arc<Mutex<RealtimeSpan>>;

/// Snapshot of one span for listings
#[derive(Debug, Clone, PartialEq)]
pub struct SpanSummary {
    pub channel: SeedName,
    pub start: i64,
    pub nsamp: usize,
    pub rate: f64,
    pub clean_decode: bool,
}

pub struct SpanRegistry {
    spans: Mutex<BTreeMap<SeedName, SharedSpan>>,
    bands: Vec<String>,
    duration_secs: f64,
    pre_duration_secs: f64,
    codec: Arc<dyn SampleCodec>,
}

impl SpanRegistry {
    pub fn new(config: &RealtimeConfig, codec: Arc<dyn SampleCodec>) -> Self {
        Self {
            spans: Mutex::new(BTreeMap::new()),
            bands: config.bands.clone(),
            duration_secs: config.duration_secs,
            pre_duration_secs: config.pre_duration_secs,
            codec,
        }
    }

    /// Whether the channel's band/instrument code is on the allow-list
    pub fn accepts(&self, channel: &SeedName) -> bool {
        self.bands.is_empty() || self.bands.iter().any(|b| b == channel.band())
    }

    /// Route one ingest event to its span; returns false if it was dropped
    pub fn on_ingest(&self, block: &TimeSeriesBlock) -> bool {
        self.on_ingest_at(block, Utc::now().timestamp_millis())
    }

    /// [`on_ingest`](Self::on_ingest) with an explicit "now" in epoch ms
    pub fn on_ingest_at(&self, block: &TimeSeriesBlock, now: i64) -> bool {
        let channel = block.channel();
        if !self.accepts(channel) {
            tracing::trace!(channel = %channel, "Band not configured for realtime, dropped");
            return false;
        }
        if block.rate() <= 0.0 {
            tracing::warn!(channel = %channel, rate = block.rate(), "Realtime block without a usable rate");
            return false;
        }

        let span = self.get_or_create(block, now);
        let mut span = span.lock().unwrap_or_else(PoisonError::into_inner);
        match block {
            TimeSeriesBlock::Raw { samples, .. } => {
                span.add_realtime(block.start_millis(), samples, self.pre_duration_secs);
            }
            TimeSeriesBlock::Compressed { .. } => {
                span.shift_add_many(
                    std::slice::from_ref(block),
                    block.start_millis(),
                    block.end_millis(),
                    self.pre_duration_secs,
                );
            }
        }
        true
    }

    fn get_or_create(&self, block: &TimeSeriesBlock, now: i64) -> SharedSpan {
        let mut spans = self.lock_spans();
        let channel = block.channel();
        if let Some(span) = spans.get(channel) {
            return Arc::clone(span);
        }

        let duration_ms = (self.duration_secs * 1000.0).round() as i64;
        let start = if block.is_compressed() {
            now - duration_ms * 9 / 10
        } else {
            block.start_millis() - duration_ms / 2
        };
        tracing::debug!(channel = %channel, start, rate = block.rate(), "Creating realtime span");

        let span = Arc::new(Mutex::new(RealtimeSpan::new(
            channel.clone(),
            start,
            block.rate(),
            self.duration_secs,
            Arc::clone(&self.codec),
        )));
        spans.insert(channel.clone(), Arc::clone(&span));
        span
    }

    /// Sorted channel names
    pub fn channels(&self) -> Vec<SeedName> {
        self.lock_spans().keys().cloned().collect()
    }

    pub fn get(&self, channel: &SeedName) -> Option<SharedSpan> {
        self.lock_spans().get(channel).cloned()
    }

    /// Drop a channel's span; returns whether it existed
    pub fn terminate(&self, channel: &SeedName) -> bool {
        let removed = self.lock_spans().remove(channel).is_some();
        if removed {
            tracing::info!(channel = %channel, "Realtime span terminated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_spans().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of every span's memory use in bytes
    pub fn memory_usage(&self) -> usize {
        self.snapshot_spans()
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).memory_usage())
            .sum()
    }

    /// Per-channel state, sorted by channel
    pub fn summaries(&self) -> Vec<SpanSummary> {
        self.snapshot_spans()
            .iter()
            .map(|s| {
                let span = s.lock().unwrap_or_else(PoisonError::into_inner);
                SpanSummary {
                    channel: span.channel().clone(),
                    start: span.start(),
                    nsamp: span.nsamp(),
                    rate: span.rate(),
                    clean_decode: span.is_clean_decode(),
                }
            })
            .collect()
    }

    fn snapshot_spans(&self) -> Vec<SharedSpan> {
        self.lock_spans().values().cloned().collect()
    }

    fn lock_spans(&self) -> MutexGuard<'_, BTreeMap<SeedName, SharedSpan>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::PlainCodec;
    use crate::storage::mseed::RecordBuilder;

    const T0: i64 = 1_390_219_200_000;

    fn registry(bands: &[&str]) -> SpanRegistry {
        let config = RealtimeConfig {
            bands: bands.iter().map(|b| b.to_string()).collect(),
            ..RealtimeConfig::default()
        };
        SpanRegistry::new(&config, Arc::new(PlainCodec))
    }

    #[test]
    fn test_band_filter_drops_without_state() {
        let reg = registry(&["BH", "HH"]);
        let block = TimeSeriesBlock::raw(SeedName::new("USDUG  LHZ00"), T0 * 1000, 1.0, vec![1; 10]);
        assert!(!reg.on_ingest_at(&block, T0));
        assert!(reg.is_empty());

        let block = TimeSeriesBlock::raw(SeedName::new("USDUG  BHZ00"), T0 * 1000, 40.0, vec![1; 40]);
        assert!(reg.on_ingest_at(&block, T0));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_raw_span_starts_half_duration_back() {
        let reg = registry(&[]);
        let name = SeedName::new("USDUG  BHZ00");
        let block = TimeSeriesBlock::raw(name.clone(), T0 * 1000, 40.0, vec![7; 40]);
        reg.on_ingest_at(&block, T0);

        let span = reg.get(&name).unwrap();
        let span = span.lock().unwrap();
        assert_eq!(span.start(), T0 - 1_800_000);
        assert_eq!(span.nsamp(), 72_040);
        assert_eq!(span.data()[72_000], 7);
    }

    #[test]
    fn test_compressed_span_positioned_before_now() {
        let reg = registry(&[]);
        let name = SeedName::new("USDUG  BHZ00");
        let now = T0 + 5000;
        let rec = RecordBuilder::new(name.clone(), T0 * 1000, 40.0)
            .build(&[3; 100])
            .unwrap();
        reg.on_ingest_at(&TimeSeriesBlock::from_record(&rec).unwrap(), now);

        let span = reg.get(&name).unwrap();
        let span = span.lock().unwrap();
        assert_eq!(span.start(), now - 3_240_000);
        let offset = span.index_of_time(T0) as usize;
        assert_eq!(&span.data()[offset..offset + 100], &[3; 100]);
    }

    #[test]
    fn test_channels_sorted_and_terminate() {
        let reg = registry(&[]);
        for name in ["USDUG  BHZ00", "IUANMO BHZ00", "USDUG  BHN00"] {
            let block = TimeSeriesBlock::raw(SeedName::new(name), T0 * 1000, 40.0, vec![1; 40]);
            reg.on_ingest_at(&block, T0);
        }
        let names: Vec<String> = reg.channels().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["IUANMO BHZ00", "USDUG  BHN00", "USDUG  BHZ00"]);
        assert!(reg.memory_usage() >= 3 * 144_000 * 4);

        assert!(reg.terminate(&SeedName::new("USDUG  BHN00")));
        assert!(!reg.terminate(&SeedName::new("USDUG  BHN00")));
        assert_eq!(reg.summaries().len(), 2);
    }
}

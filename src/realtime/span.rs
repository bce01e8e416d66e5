//! Realtime span: the most recent `duration` seconds of one channel
//!
//! ```text
//! start                                  nsamp            capacity
//!   │ data data FILL data data data data │ FILL FILL FILL │
//!   └───────────── RunList covers real data ─────────────┘
//!
//! shift(t): offset = index_of_time(t)
//!   data[offset..] → data[0..], tail filled with FILL,
//!   nsamp -= offset, anchors and runs trimmed
//! ```
//!
//! Blocks may arrive out of order or overlap; each is decoded once and
//! copied to the offset its start time projects to. Input that falls
//! outside the buffer is clipped rather than rejected.

use crate::realtime::anchors::TimeAnchorIndex;
use crate::realtime::block::TimeSeriesBlock;
use crate::realtime::rate::RateEstimator;
use crate::realtime::runs::RunList;
use crate::storage::codec::SampleCodec;
use crate::storage::types::SeedName;
use std::sync::Arc;

/// Sample value meaning "no data"
pub const FILL: i32 = i32::MIN;

/// Upper bound on consecutive shifts for one realtime insert
const MAX_SHIFTS: usize = 4;

/// What a call to [`RealtimeSpan::shift`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOutcome {
    /// The buffer was cleared and restarted at the target time
    Reset,
    /// Samples moved down by this many positions
    Shifted(usize),
    /// The target precedes the buffer start; nothing changed
    Refused,
    /// The target is already the buffer start
    Noop,
}

/// A contiguous piece of real data produced by [`RealtimeSpan::make_trace_buf`]
#[derive(Debug, Clone, PartialEq)]
pub struct TraceChunk {
    pub channel: SeedName,
    pub start_millis: i64,
    pub rate: f64,
    pub samples: Vec<i32>,
}

pub struct RealtimeSpan {
    channel: SeedName,
    duration_secs: f64,
    rate: f64,
    start: i64,
    nsamp: usize,
    data: Vec<i32>,
    anchors: TimeAnchorIndex,
    runs: RunList,
    estimator: RateEstimator,
    clean_decode: bool,
    scratch: Vec<i32>,
    codec: Arc<dyn SampleCodec>,
}

impl RealtimeSpan {
    /// Empty span for `channel` whose sample 0 is at `start_millis`
    pub fn new(
        channel: SeedName,
        start_millis: i64,
        rate: f64,
        duration_secs: f64,
        codec: Arc<dyn SampleCodec>,
    ) -> Self {
        let capacity = ((duration_secs * rate).round() as usize).max(1);
        let mut anchors = TimeAnchorIndex::new(rate, duration_secs);
        anchors.add_time(0, start_millis);

        Self {
            channel,
            duration_secs,
            rate,
            start: start_millis,
            nsamp: 0,
            data: vec![FILL; capacity],
            anchors,
            runs: RunList::new(rate),
            estimator: RateEstimator::new(rate, duration_secs),
            clean_decode: true,
            scratch: Vec::new(),
            codec,
        }
    }

    pub fn channel(&self) -> &SeedName {
        &self.channel
    }

    /// Time of sample 0, epoch ms
    pub fn start(&self) -> i64 {
        self.start
    }

    /// High-water mark: positions at or past it hold FILL
    pub fn nsamp(&self) -> usize {
        self.nsamp
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    pub fn anchors(&self) -> &TimeAnchorIndex {
        &self.anchors
    }

    pub fn runs(&self) -> &RunList {
        &self.runs
    }

    /// False once any block failed to decode
    pub fn is_clean_decode(&self) -> bool {
        self.clean_decode
    }

    /// Time of sample `offset`, epoch ms
    pub fn time_at_index(&self, offset: i64) -> i64 {
        self.anchors
            .time_at_index(offset)
            .unwrap_or_else(|| self.start + (offset as f64 / self.rate * 1000.0).round() as i64)
    }

    /// Offset of the sample at `time`, possibly outside the buffer
    pub fn index_of_time(&self, time: i64) -> i64 {
        self.anchors
            .index_of_time(time)
            .unwrap_or_else(|| ((time - self.start) as f64 / 1000.0 * self.rate).round() as i64)
    }

    /// Time just past the last buffer position
    pub fn end_time(&self) -> i64 {
        self.time_at_index(self.data.len() as i64)
    }

    /// Decode a block and merge it at the offset its start time projects to
    pub fn add_block(&mut self, block: &TimeSeriesBlock) -> usize {
        let mut samples = std::mem::take(&mut self.scratch);
        if let Err(e) = block.decode(self.codec.as_ref(), &mut samples) {
            self.clean_decode = false;
            tracing::warn!(
                channel = %self.channel,
                start = block.start_millis(),
                error = %e,
                "Cannot decode realtime block"
            );
            self.scratch = samples;
            return 0;
        }

        let start = block.start_millis();
        let offset = self.index_of_time(start);
        let copied = self.place(offset, &samples, start);
        self.scratch = samples;

        self.observe_rate(block.start_micros(), block.nsamp());
        copied
    }

    /// Move the buffer so that it starts at `target` (epoch ms)
    pub fn shift(&mut self, target: i64) -> ShiftOutcome {
        if self.nsamp == 0 || self.anchors.is_empty() {
            self.reset(target);
            return ShiftOutcome::Reset;
        }

        let offset = self.index_of_time(target);
        if offset < 0 {
            tracing::warn!(
                channel = %self.channel,
                target,
                start = self.start,
                offset,
                "Refusing stale shift before buffer start"
            );
            return ShiftOutcome::Refused;
        }
        let capacity = self.data.len();
        if offset as usize >= capacity {
            tracing::debug!(channel = %self.channel, target, "Shift past buffer end, resetting");
            self.reset(target);
            return ShiftOutcome::Reset;
        }
        if offset == 0 {
            return ShiftOutcome::Noop;
        }

        let off = offset as usize;
        let new_start = self.time_at_index(offset);
        self.data.copy_within(off.., 0);
        self.data[capacity - off..].fill(FILL);
        self.nsamp = self.nsamp.saturating_sub(off);
        self.start = new_start;

        self.anchors.trim(new_start, offset);
        self.anchors.add_time(0, new_start);
        self.runs.trim(new_start);

        tracing::trace!(channel = %self.channel, shifted = off, start = new_start, "Span shifted");
        ShiftOutcome::Shifted(off)
    }

    /// Merge a batch of compressed blocks covering `[begin, end)`
    ///
    /// When `end` runs past the buffer, the buffer is first shifted so that
    /// `pre_duration_secs` of older data stay in front of `begin`. Blocks are
    /// added newest first; blocks ending before the buffer start are skipped.
    pub fn shift_add_many(
        &mut self,
        blocks: &[TimeSeriesBlock],
        begin: i64,
        end: i64,
        pre_duration_secs: f64,
    ) -> usize {
        if blocks.is_empty() {
            return 0;
        }
        let latest = blocks
            .iter()
            .map(|b| b.end_millis())
            .max()
            .unwrap_or(end)
            .max(end);

        if latest > self.end_time() {
            let target = begin - self.round_to_sample(pre_duration_secs);
            self.shift(target);
        }

        let mut order: Vec<&TimeSeriesBlock> = blocks.iter().collect();
        order.sort_by_key(|b| std::cmp::Reverse(b.start_micros()));

        let mut copied = 0;
        for block in order {
            if block.end_millis() < self.start {
                tracing::trace!(
                    channel = %self.channel,
                    start = block.start_millis(),
                    "Skipping block older than buffer"
                );
                continue;
            }
            copied += self.add_block(block);
        }
        copied
    }

    /// Merge uncompressed samples starting at `start` (epoch ms)
    pub fn add_realtime(&mut self, start: i64, samples: &[i32], pre_duration_secs: f64) -> usize {
        if samples.is_empty() || self.rate <= 0.0 {
            return 0;
        }
        let span_ms = (samples.len() as f64 / self.rate * 1000.0).round() as i64;

        for _ in 0..MAX_SHIFTS {
            if start + span_ms <= self.end_time() {
                break;
            }
            let target = start - self.round_to_sample(pre_duration_secs);
            match self.shift(target) {
                ShiftOutcome::Refused | ShiftOutcome::Noop => break,
                ShiftOutcome::Reset | ShiftOutcome::Shifted(_) => {}
            }
        }

        let offset = self.index_of_time(start);
        let copied = self.place(offset, samples, start);
        self.observe_rate(start * 1000, samples.len());
        copied
    }

    /// Emit the real data inside `[start, start + duration_ms)` in chunks of
    /// at most `max_chunk` samples; returns the number of chunks
    pub fn make_trace_buf(
        &mut self,
        start: i64,
        duration_ms: i64,
        max_chunk: usize,
        sink: &mut dyn FnMut(TraceChunk),
    ) -> usize {
        self.runs.consolidate();
        let end = start + duration_ms;
        let max_chunk = max_chunk.max(1);
        let mut next_free: i64 = 0;
        let mut chunks = 0;

        for run in self.runs.runs() {
            let from = run.start.max(start);
            let to = run.end.min(end);
            if from >= to {
                continue;
            }

            let mut off = self.index_of_time(from).max(next_free).max(0);
            let stop = self.index_of_time(to).min(self.nsamp as i64);
            while off < stop {
                let chunk_end = (off + max_chunk as i64).min(stop);
                let mut slice = &self.data[off as usize..chunk_end as usize];
                if slice.last() == Some(&FILL) {
                    slice = &slice[..slice.len() - 1];
                }
                if !slice.is_empty() {
                    sink(TraceChunk {
                        channel: self.channel.clone(),
                        start_millis: self.time_at_index(off),
                        rate: self.rate,
                        samples: slice.to_vec(),
                    });
                    chunks += 1;
                }
                next_free = chunk_end;
                off = chunk_end;
            }
        }
        chunks
    }

    /// Bytes held by the buffer and its bookkeeping
    pub fn memory_usage(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<i32>()
            + self.scratch.capacity() * std::mem::size_of::<i32>()
            + self.anchors.memory_usage()
            + self.runs.memory_usage()
    }

    /// `secs` rounded to a whole number of samples, in ms
    fn round_to_sample(&self, secs: f64) -> i64 {
        if self.rate <= 0.0 {
            return (secs * 1000.0).round() as i64;
        }
        let samples = (secs * self.rate).round();
        (samples / self.rate * 1000.0).round() as i64
    }

    fn reset(&mut self, target: i64) {
        self.data.fill(FILL);
        self.nsamp = 0;
        self.start = target;
        self.anchors.clear();
        self.anchors.add_time(0, target);
        self.runs.clear();
    }

    /// Copy `samples` whose first sample is at `time` to buffer `offset`, clipping
    fn place(&mut self, offset: i64, samples: &[i32], time: i64) -> usize {
        let capacity = self.data.len() as i64;
        let n = samples.len() as i64;
        if offset + n <= 0 || offset >= capacity {
            tracing::debug!(
                channel = %self.channel,
                offset,
                nsamp = n,
                "Block outside realtime buffer, skipped"
            );
            return 0;
        }

        let src = (-offset).max(0);
        let dst = offset.max(0);
        let count = (n - src).min(capacity - dst);
        let (src, dst, count) = (src as usize, dst as usize, count as usize);

        self.data[dst..dst + count].copy_from_slice(&samples[src..src + count]);
        self.nsamp = self.nsamp.max(dst + count);

        let first_time = time + (src as f64 / self.rate * 1000.0).round() as i64;
        self.anchors.add_time(dst as i64, first_time);
        let run_end = first_time + (count as f64 / self.rate * 1000.0).round() as i64;
        self.runs.add(first_time, run_end);
        count
    }

    fn observe_rate(&mut self, start_micros: i64, nsamp: usize) {
        if !self.estimator.submit(start_micros, nsamp) {
            return;
        }
        let best = self.estimator.best_rate();
        if (best - self.rate).abs() <= f64::EPSILON * self.rate {
            return;
        }
        tracing::debug!(channel = %self.channel, old = self.rate, new = best, "Realtime rate refined");
        let cleared = self.anchors.set_rate(best);
        self.rate = best;
        self.runs.set_rate(best);
        if cleared {
            self.anchors.add_time(0, self.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::PlainCodec;
    use crate::storage::mseed::RecordBuilder;

    // 2014-01-20 12:00:00 UTC
    const T0: i64 = 1_390_219_200_000;

    fn name() -> SeedName {
        SeedName::new("USDUG  BHZ00")
    }

    fn span(start: i64, duration: f64) -> RealtimeSpan {
        RealtimeSpan::new(name(), start, 40.0, duration, Arc::new(PlainCodec))
    }

    fn ramp(from: i32, n: usize) -> Vec<i32> {
        (from..from + n as i32).collect()
    }

    #[test]
    fn test_three_raw_blocks_from_start() {
        let mut span = span(T0, 3600.0);
        for i in 0..3 {
            span.add_realtime(T0 + i * 1000, &ramp(i as i32 * 40, 40), 2700.0);
        }
        assert_eq!(span.nsamp(), 120);
        assert_eq!(span.time_at_index(0), T0);
        assert_eq!(&span.data()[..120], ramp(0, 120).as_slice());
        assert_eq!(span.data()[120], FILL);
    }

    #[test]
    fn test_out_of_order_blocks_fill_gaps() {
        let mut span = span(T0, 600.0);
        span.add_realtime(T0 + 2000, &ramp(80, 40), 450.0);
        assert_eq!(span.nsamp(), 120);
        assert!(span.data()[..80].iter().all(|&v| v == FILL));

        span.add_realtime(T0, &ramp(0, 80), 450.0);
        assert_eq!(span.nsamp(), 120);
        assert_eq!(&span.data()[..120], ramp(0, 120).as_slice());
    }

    #[test]
    fn test_clipping_at_both_edges() {
        let mut span = span(T0, 10.0);
        assert_eq!(span.capacity(), 400);

        // Starts one second before the buffer: only the tail lands
        let copied = span.add_block(&TimeSeriesBlock::raw(name(), (T0 - 1000) * 1000, 40.0, ramp(0, 80)));
        assert_eq!(copied, 40);
        assert_eq!(span.data()[0], 40);

        // Runs off the end: only the head lands
        let copied = span.add_block(&TimeSeriesBlock::raw(name(), (T0 + 9000) * 1000, 40.0, ramp(0, 80)));
        assert_eq!(copied, 40);
        assert_eq!(span.nsamp(), 400);
        assert_eq!(span.data()[399], 39);

        // Entirely outside
        let copied = span.add_block(&TimeSeriesBlock::raw(name(), (T0 + 20_000) * 1000, 40.0, ramp(0, 40)));
        assert_eq!(copied, 0);
    }

    #[test]
    fn test_shift_moves_samples() {
        let mut span = span(T0, 100.0);
        span.add_realtime(T0, &ramp(0, 2000), 50.0);
        let before = span.data().to_vec();
        let nsamp = span.nsamp();

        let outcome = span.shift(T0 + 10_000);
        assert_eq!(outcome, ShiftOutcome::Shifted(400));
        assert_eq!(span.nsamp(), nsamp - 400);
        assert_eq!(span.start(), T0 + 10_000);
        for p in 400..nsamp {
            assert_eq!(span.data()[p - 400], before[p]);
        }
        assert!(span.data()[span.nsamp()..].iter().all(|&v| v == FILL));
        assert_eq!(span.time_at_index(0), T0 + 10_000);
    }

    #[test]
    fn test_shift_edge_cases() {
        let mut span = span(T0, 100.0);
        // Empty buffer always resets
        assert_eq!(span.shift(T0 + 5000), ShiftOutcome::Reset);
        assert_eq!(span.start(), T0 + 5000);

        span.add_realtime(T0 + 5000, &ramp(0, 400), 50.0);
        assert_eq!(span.shift(T0), ShiftOutcome::Refused);
        assert_eq!(span.start(), T0 + 5000);
        assert_eq!(span.shift(T0 + 5000), ShiftOutcome::Noop);

        assert_eq!(span.shift(T0 + 500_000), ShiftOutcome::Reset);
        assert_eq!(span.nsamp(), 0);
        assert_eq!(span.start(), T0 + 500_000);
        assert!(span.runs().is_empty());
    }

    #[test]
    fn test_shift_add_many_keeps_pre_duration() {
        let mut span = span(T0, 3600.0);
        let first = RecordBuilder::new(name(), T0 * 1000, 40.0)
            .build(&ramp(0, 100))
            .unwrap();
        span.add_block(&TimeSeriesBlock::from_record(&first).unwrap());
        let trailing = span.end_time();
        assert_eq!(trailing, T0 + 3_600_000);

        // A block whose end is 10 s past the trailing edge
        let begin = trailing + 10_000 - 2500;
        let rec = RecordBuilder::new(name(), begin * 1000, 40.0)
            .build(&ramp(1000, 100))
            .unwrap();
        let block = TimeSeriesBlock::from_record(&rec).unwrap();
        let end = block.end_millis();
        assert_eq!(end, trailing + 10_000);

        span.shift_add_many(std::slice::from_ref(&block), begin, end, 2700.0);
        assert_eq!(span.start(), begin - 2_700_000);
        let offset = span.index_of_time(begin) as usize;
        assert_eq!(span.data()[offset], 1000);
    }

    #[test]
    fn test_shift_add_many_skips_stale_blocks() {
        let mut span = span(T0, 100.0);
        let stale = TimeSeriesBlock::raw(name(), (T0 - 50_000) * 1000, 40.0, ramp(0, 40));
        let fresh = TimeSeriesBlock::raw(name(), T0 * 1000, 40.0, ramp(0, 40));
        let copied = span.shift_add_many(&[stale, fresh], T0 - 50_000, T0 + 1000, 75.0);
        assert_eq!(copied, 40);
    }

    #[test]
    fn test_unsupported_encoding_marks_unclean() {
        let mut span = span(T0, 100.0);
        let block = TimeSeriesBlock::Compressed {
            channel: name(),
            start_micros: T0 * 1000,
            rate: 40.0,
            nsamp: 40,
            encoding: crate::storage::codec::encoding::STEIM2,
            big_endian: true,
            payload: vec![0; 448],
        };
        assert_eq!(span.add_block(&block), 0);
        assert!(!span.is_clean_decode());
        assert_eq!(span.nsamp(), 0);
    }

    #[test]
    fn test_make_trace_buf_emits_only_real_data() {
        let mut span = span(T0, 100.0);
        span.add_realtime(T0, &ramp(0, 400), 50.0);
        span.add_realtime(T0 + 20_000, &ramp(800, 400), 50.0);

        let mut chunks = Vec::new();
        let n = span.make_trace_buf(T0, 100_000, 150, &mut |c| chunks.push(c));
        assert_eq!(n, chunks.len());

        let total: usize = chunks.iter().map(|c| c.samples.len()).sum();
        assert_eq!(total, 800);
        assert!(chunks.iter().all(|c| c.samples.len() <= 150));
        assert!(chunks.iter().all(|c| !c.samples.contains(&FILL)));
        assert_eq!(chunks[0].start_millis, T0);
        let second_run = chunks.iter().find(|c| c.samples[0] == 800).unwrap();
        assert_eq!(second_run.start_millis, T0 + 20_000);
    }

    #[test]
    fn test_make_trace_buf_window() {
        let mut span = span(T0, 100.0);
        span.add_realtime(T0, &ramp(0, 400), 50.0);

        let mut chunks = Vec::new();
        span.make_trace_buf(T0 + 2500, 1000, 1000, &mut |c| chunks.push(c));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples, ramp(100, 40));
        assert_eq!(chunks[0].start_millis, T0 + 2500);
    }

    #[test]
    fn test_rate_extremes_place_by_time() {
        let mut slow = RealtimeSpan::new(name(), T0, 1.0, 600.0, Arc::new(PlainCodec));
        assert_eq!(slow.add_realtime(T0 + 10_000, &ramp(0, 10), 450.0), 10);
        assert_eq!(slow.index_of_time(T0 + 10_000), 10);
        assert_eq!(slow.time_at_index(19), T0 + 19_000);
        assert_eq!(slow.data()[10], 0);

        let mut fast = RealtimeSpan::new(name(), T0, 1000.0, 60.0, Arc::new(PlainCodec));
        assert_eq!(fast.add_realtime(T0 + 1500, &ramp(7, 500), 45.0), 500);
        assert_eq!(fast.index_of_time(T0 + 1500), 1500);
        assert_eq!(fast.time_at_index(1999), T0 + 1999);
        assert_eq!(&fast.data()[1500..1502], &[7, 8]);
    }

    #[test]
    fn test_refined_rate_reprojects_anchors() {
        // Digitizer running at 40.1 Hz against a nominal 40 Hz
        let mut span = span(T0, 3600.0);
        for i in 0..30i64 {
            let start = T0 * 1000 + ((i * 112) as f64 * 1_000_000.0 / 40.1).round() as i64;
            let block = TimeSeriesBlock::raw(name(), start, 40.0, ramp(0, 112));
            assert_eq!(span.add_block(&block), 112);
        }
        assert_eq!(span.rate(), 40.0);

        // The gap closes the 84 s run and promotes its measured rate
        let block = TimeSeriesBlock::raw(name(), (T0 + 300_000) * 1000, 40.0, ramp(0, 112));
        span.add_block(&block);
        let rate = span.rate();
        assert!(rate != 40.0 && (rate - 40.1).abs() < 0.01, "rate {}", rate);
        assert_eq!(span.anchors().rate(), rate);

        let last = *span.anchors().anchors().last().unwrap();
        assert_eq!(last.time, T0 + 300_000);
        assert_eq!(
            span.time_at_index(last.offset + 4010),
            last.time + (4010.0 / rate * 1000.0).round() as i64
        );
        assert!(span.time_at_index(last.offset + 4010) < last.time + 100_250);
        assert_eq!(
            span.index_of_time(last.time + 100_000),
            last.offset + (100.0 * rate).round() as i64
        );
        assert!(span.index_of_time(last.time + 100_000) > last.offset + 4000);
    }

    #[test]
    fn test_memory_usage_counts_buffer() {
        let span = span(T0, 100.0);
        assert!(span.memory_usage() >= 4000 * 4);
    }
}

//! Per-connection command execution
//!
//! A session owns one [`DiskQueryEngine`] and answers one command line at a
//! time, writing raw records, listing lines or tombstone lines followed by a
//! sentinel:
//!
//! - `<EOR>` zero-padded to 512 bytes after data (64 with `-gaps`, 5 after
//!   deletes and listings), only when the line ended with `\t`
//! - `<ERR>` (5 bytes) after a protocol-fatal error; the connection closes

use crate::context::Context;
use crate::query::command::{QueryCommand, QueryMode, Terminator};
use crate::query::dedup::ResultArraySink;
use crate::query::delete::DeleteTombstone;
use crate::query::engine::{DiskQueryEngine, QueryParameters, RecordSink};
use crate::query::error::{QueryError, QueryResult};
use crate::query::listing;
use crate::storage::mseed::{RecordBuilder, RecordHeader, BLOCK_SIZE};
use crate::storage::types::{julian_from_millis, julian_start_millis, TimeRange, MS_PER_DAY};
use regex::Regex;
use std::io::Write;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

/// End-of-response marker
pub const EOR: &[u8] = b"<EOR>";

/// Fatal-error marker
pub const ERR: &[u8] = b"<ERR>";

/// Bytes sent per record with `-gaps`
pub const GAPS_BYTES: usize = 64;

/// Sleeps after every `every` bytes written
struct Throttle {
    every: usize,
    pause: Duration,
    since: usize,
}

impl Throttle {
    fn account(&mut self, bytes: usize) {
        self.since += bytes;
        if self.since >= self.every {
            std::thread::sleep(self.pause);
            self.since = 0;
        }
    }
}

/// Writes records straight to the client
struct StreamSink<'a, W: Write> {
    out: &'a mut W,
    gaps: bool,
    throttle: Option<Throttle>,
    bytes: usize,
}

impl<W: Write> StreamSink<'_, W> {
    fn write(&mut self, bytes: &[u8]) -> QueryResult<()> {
        let n = if self.gaps {
            bytes.len().min(GAPS_BYTES)
        } else {
            bytes.len()
        };
        self.out.write_all(&bytes[..n])?;
        self.bytes += n;
        if let Some(throttle) = self.throttle.as_mut() {
            throttle.account(n);
        }
        Ok(())
    }
}

impl<W: Write> RecordSink for StreamSink<'_, W> {
    fn record(&mut self, _header: &RecordHeader, bytes: &[u8]) -> QueryResult<()> {
        self.write(bytes)
    }
}

/// Writes one line per freed slot
struct TombstoneSink<'a, W: Write> {
    out: &'a mut W,
}

impl<W: Write> RecordSink for TombstoneSink<'_, W> {
    fn record(&mut self, _header: &RecordHeader, _bytes: &[u8]) -> QueryResult<()> {
        Ok(())
    }

    fn tombstone(&mut self, tombstone: &DeleteTombstone) -> QueryResult<()> {
        writeln!(self.out, "{}", tombstone)?;
        Ok(())
    }
}

pub struct QuerySession {
    ctx: Arc<Context>,
    peer: IpAddr,
    engine: DiskQueryEngine,
    commands: u64,
}

impl QuerySession {
    pub fn new(ctx: Arc<Context>, peer: IpAddr) -> Self {
        let engine = ctx.engine();
        Self {
            ctx,
            peer,
            engine,
            commands: 0,
        }
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    /// Commands handled so far
    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Answer one command line; the returned terminator says whether to keep reading
    ///
    /// Errors are only returned when the client can no longer be written to.
    pub fn handle_line<W: Write>(&mut self, line: &str, out: &mut W) -> QueryResult<Terminator> {
        self.commands += 1;

        let cmd = match QueryCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::error!(peer = %self.peer, line = line.trim_end(), error = %e, "Bad command");
                write_sentinel(out, ERR, ERR.len())?;
                return Ok(Terminator::Close);
            }
        };
        tracing::debug!(peer = %self.peer, command = ?cmd, "Command received");

        let result = self.execute(&cmd, out);
        self.engine.reset();
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!(peer = %self.peer, line = line.trim_end(), error = %e, "Command failed");
                write_sentinel(out, ERR, ERR.len())?;
                return Ok(Terminator::Close);
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, line = line.trim_end(), error = %e, "Command incomplete");
            }
        }

        if cmd.terminator == Terminator::KeepOpen {
            let size = match cmd.mode {
                QueryMode::Data | QueryMode::Realtime if cmd.gaps => GAPS_BYTES,
                QueryMode::Data | QueryMode::Realtime => BLOCK_SIZE,
                _ => EOR.len(),
            };
            write_sentinel(out, EOR, size)?;
        }
        out.flush()?;
        Ok(cmd.terminator)
    }

    fn execute<W: Write>(&mut self, cmd: &QueryCommand, out: &mut W) -> QueryResult<()> {
        match cmd.mode {
            QueryMode::ListRealtime => return self.list_realtime(cmd, out),
            QueryMode::Realtime => return self.send_realtime(cmd, out),
            _ => {}
        }
        if cmd.mode == QueryMode::Delete && !self.ctx.is_privileged(&self.peer) {
            return Err(QueryError::Parse(format!(
                "delete not permitted from {}",
                self.peer
            )));
        }

        let range = self.request_range(cmd)?;
        let params = QueryParameters {
            begin: range.start,
            end: range.end,
            exclude: cmd.exclude.clone(),
            gaps_only: cmd.gaps,
            allow_deleted: cmd.allow_deleted,
            directory_only: cmd.mode == QueryMode::ListFiles,
            privileged: self.ctx.is_privileged(&self.peer),
            show_illegal: cmd.show_illegal,
        };
        self.engine.set_parameters(params)?;

        if let Some(ring) = &cmd.ring {
            let stations = self.ctx.metadata.stations_in_ring(ring)?;
            tracing::debug!(stations = stations.len(), "Ring filter resolved");
            self.engine.select_stations(Some(stations.into_iter().collect()));
        }

        if cmd.mode == QueryMode::ListFiles {
            for desc in self.engine.descriptors() {
                writeln!(out, "{}", listing::file_line(desc))?;
            }
            return Ok(());
        }

        let mask = cmd.mask.as_deref().unwrap_or(".*");
        let channels = self.engine.query_matches(mask)?;

        match cmd.mode {
            QueryMode::ListChannels => {
                for channel in &channels {
                    if let Some(days) = self.engine.channel_days().get(channel) {
                        writeln!(out, "{}", listing::channel_line(channel, days))?;
                    }
                }
            }
            QueryMode::Delete => {
                let mut sink = TombstoneSink { out };
                let mut touched = 0;
                for channel in &channels {
                    touched += self.engine.query(channel, &mut sink, true)?;
                }
                tracing::info!(peer = %self.peer, channels = channels.len(), records = touched, "Delete applied");
            }
            _ if cmd.dedup => {
                let mut collected = ResultArraySink::new(range.duration_secs());
                for channel in &channels {
                    self.engine.query(channel, &mut collected, false)?;
                }
                let suppressed = collected.suppressed();
                let mut sink = self.stream_sink(cmd, out);
                for entry in collected.into_entries() {
                    sink.write(&entry.bytes)?;
                }
                tracing::debug!(bytes = sink.bytes, suppressed, "Deduplicated data sent");
            }
            _ => {
                let mut sink = self.stream_sink(cmd, out);
                let mut records = 0;
                for channel in &channels {
                    records += self.engine.query(channel, &mut sink, false)?;
                }
                tracing::debug!(channels = channels.len(), records, bytes = sink.bytes, "Data sent");
            }
        }
        Ok(())
    }

    fn stream_sink<'a, W: Write>(&self, cmd: &QueryCommand, out: &'a mut W) -> StreamSink<'a, W> {
        let query = &self.ctx.config.query;
        let throttle = (cmd.nice.unwrap_or(true) && query.nice_bytes > 0).then(|| Throttle {
            every: query.nice_bytes,
            pause: Duration::from_millis(query.nice_pause_ms),
            since: 0,
        });
        StreamSink {
            out,
            gaps: cmd.gaps,
            throttle,
            bytes: 0,
        }
    }

    /// `-b`/`-d`/`-ed`; listings without `-b` cover the last `max_days` days
    fn request_range(&self, cmd: &QueryCommand) -> QueryResult<TimeRange> {
        let query = &self.ctx.config.query;
        if let Some(range) = cmd.time_range(query.default_duration_secs)? {
            return Ok(range);
        }
        if !cmd.mode.is_listing() {
            return Err(QueryError::Parse("-b begin time is required".to_string()));
        }
        let today = julian_from_millis(chrono::Utc::now().timestamp_millis());
        let end = julian_start_millis(today + 1);
        Ok(TimeRange {
            start: end - query.max_days * MS_PER_DAY,
            end,
        })
    }

    /// Realtime chunks re-packed as 512-byte INT32 records
    fn send_realtime<W: Write>(&self, cmd: &QueryCommand, out: &mut W) -> QueryResult<()> {
        let range = self.request_range(cmd)?;
        let pattern = mask_pattern(cmd.mask.as_deref())?;
        let max_chunk = self.ctx.config.realtime.max_chunk_samples;

        let mut chunks = Vec::new();
        for channel in self.ctx.spans.channels() {
            if pattern.as_ref().is_some_and(|p| !p.is_match(channel.as_str())) {
                continue;
            }
            if !self.ctx.restrictions.is_public(&channel) && !self.ctx.is_privileged(&self.peer) {
                continue;
            }
            if let Some(span) = self.ctx.spans.get(&channel) {
                let mut span = span.lock().unwrap_or_else(PoisonError::into_inner);
                span.make_trace_buf(range.start, range.end - range.start, max_chunk, &mut |c| {
                    chunks.push(c)
                });
            }
        }

        let mut sink = self.stream_sink(cmd, out);
        let mut records = 0;
        for chunk in &chunks {
            let builder = RecordBuilder::new(chunk.channel.clone(), 0, chunk.rate);
            let per_record = builder.capacity().max(1);
            for (i, samples) in chunk.samples.chunks(per_record).enumerate() {
                let offset_micros =
                    ((i * per_record) as f64 / chunk.rate * 1_000_000.0).round() as i64;
                let record = RecordBuilder::new(
                    chunk.channel.clone(),
                    chunk.start_millis * 1000 + offset_micros,
                    chunk.rate,
                )
                .sequence(records as u32 + 1)
                .build(samples)?;
                sink.write(&record)?;
                records += 1;
            }
        }
        tracing::debug!(chunks = chunks.len(), records, "Realtime data sent");
        Ok(())
    }

    fn list_realtime<W: Write>(&self, cmd: &QueryCommand, out: &mut W) -> QueryResult<()> {
        let pattern = mask_pattern(cmd.mask.as_deref())?;
        for summary in self.ctx.spans.summaries() {
            if pattern
                .as_ref()
                .is_some_and(|p| !p.is_match(summary.channel.as_str()))
            {
                continue;
            }
            writeln!(out, "{}", listing::realtime_line(&summary))?;
        }
        Ok(())
    }
}

/// Anchored channel regex, if a mask was given
fn mask_pattern(mask: Option<&str>) -> QueryResult<Option<Regex>> {
    mask.map(|mask| {
        Regex::new(&format!("^(?:{})$", mask))
            .map_err(|e| QueryError::Parse(format!("bad channel mask '{}': {}", mask, e)))
    })
    .transpose()
}

/// `marker` zero-padded to `size` bytes
fn write_sentinel<W: Write>(out: &mut W, marker: &[u8], size: usize) -> QueryResult<()> {
    let mut block = vec![0u8; size.max(marker.len())];
    block[..marker.len()].copy_from_slice(marker);
    out.write_all(&block)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::realtime::TimeSeriesBlock;
    use crate::storage::index_file::IndexFileWriter;
    use crate::storage::mseed::RecordBuilder;
    use crate::storage::types::SeedName;
    use std::path::Path;
    use tempfile::tempdir;

    // 2014-01-20 12:00:00 UTC
    const T0: i64 = 1_390_219_200_000;

    fn record(name: &str, start_ms: i64, fill: i32) -> Vec<u8> {
        RecordBuilder::new(SeedName::new(name), start_ms * 1000, 40.0)
            .build(&[fill; 100])
            .unwrap()
    }

    fn store(dir: &Path) -> Vec<Vec<u8>> {
        let records: Vec<Vec<u8>> = (0..4)
            .map(|i| record("USDUG  BHZ00", T0 + i * 2500, i as i32))
            .chain([record("USDUG  BHN00", T0, 9), record("XXSEC  BHZ00", T0, 8)])
            .collect();
        let mut writer = IndexFileWriter::create(dir, julian_from_millis(T0), "CI").unwrap();
        for r in &records {
            writer.append(r).unwrap();
        }
        writer.finish().unwrap();
        records
    }

    fn open_session(dir: &Path, peer: &str) -> QuerySession {
        let mut config = Config::default();
        config.storage.roots = vec![dir.display().to_string()];
        config.query.privileged_hosts = vec!["127.0.0.1".into()];
        config.query.restricted = vec!["XX".into()];
        config.query.nice_bytes = 0;
        let ctx = Arc::new(Context::new(config));
        ctx.directory.refresh();
        QuerySession::new(ctx, peer.parse().unwrap())
    }

    #[test]
    fn test_data_request_with_eor() {
        let dir = tempdir().unwrap();
        let records = store(dir.path());
        let mut session = open_session(dir.path(), "10.0.0.5");

        let mut out = Vec::new();
        let term = session
            .handle_line("'-s' 'USDUG  BHZ..' '-b' '2014/01/20 12:00:00' '-d' '5'\t", &mut out)
            .unwrap();
        assert_eq!(term, Terminator::KeepOpen);
        assert_eq!(out.len(), 3 * BLOCK_SIZE);
        assert_eq!(&out[..BLOCK_SIZE], &records[0][..]);
        assert_eq!(&out[BLOCK_SIZE..2 * BLOCK_SIZE], &records[1][..]);
        assert!(out[2 * BLOCK_SIZE..].starts_with(EOR));
        assert!(out[2 * BLOCK_SIZE + EOR.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_close_terminator_sends_no_sentinel() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let mut session = open_session(dir.path(), "10.0.0.5");

        let mut out = Vec::new();
        let term = session
            .handle_line("'-s' 'USDUG  BHN00' '-b' '2014/01/20 12:00:00' '-d' '5'\n", &mut out)
            .unwrap();
        assert_eq!(term, Terminator::Close);
        assert_eq!(out.len(), BLOCK_SIZE);
    }

    #[test]
    fn test_gaps_sends_headers_only() {
        let dir = tempdir().unwrap();
        let records = store(dir.path());
        let mut session = open_session(dir.path(), "10.0.0.5");

        let mut out = Vec::new();
        session
            .handle_line(
                "'-s' 'USDUG  BHZ00' '-b' '2014/01/20 12:00:00' '-d' '10' '-gaps'\t",
                &mut out,
            )
            .unwrap();
        assert_eq!(out.len(), 5 * GAPS_BYTES);
        assert_eq!(&out[GAPS_BYTES..2 * GAPS_BYTES], &records[1][..GAPS_BYTES]);
        assert!(out[4 * GAPS_BYTES..].starts_with(EOR));
    }

    #[test]
    fn test_restricted_channels_need_privilege() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let line = "'-s' 'XX.*' '-b' '2014/01/20 12:00:00' '-d' '5'\t";

        let mut out = Vec::new();
        open_session(dir.path(), "10.0.0.5").handle_line(line, &mut out).unwrap();
        assert_eq!(out.len(), BLOCK_SIZE);

        let mut out = Vec::new();
        open_session(dir.path(), "127.0.0.1").handle_line(line, &mut out).unwrap();
        assert_eq!(out.len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn test_delete_inside_record_sends_err() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let mut session = open_session(dir.path(), "127.0.0.1");

        let mut out = Vec::new();
        let term = session
            .handle_line(
                "'-s' 'USDUG  BHZ00' '-b' '2014/01/20 12:00:01' '-d' '1' '-delete'\t",
                &mut out,
            )
            .unwrap();
        assert_eq!(term, Terminator::Close);
        assert_eq!(out, ERR.to_vec());
    }

    #[test]
    fn test_delete_lines_and_short_eor() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let mut session = open_session(dir.path(), "127.0.0.1");

        let mut out = Vec::new();
        session
            .handle_line(
                "'-s' 'USDUG  BHZ00' '-b' '2014/01/20 12:00:02.500' '-d' '5' '-delete'\t",
                &mut out,
            )
            .unwrap();
        let text = String::from_utf8_lossy(&out);
        assert_eq!(text.lines().filter(|l| l.starts_with("DEL ")).count(), 2);
        assert!(out.ends_with(EOR));

        // Unprivileged peers may not delete
        let mut other = open_session(dir.path(), "10.0.0.5");
        let mut out = Vec::new();
        other
            .handle_line("'-s' 'USDUG  BHZ00' '-b' '2014/01/20 12:00:00' '-delete'\t", &mut out)
            .unwrap();
        assert_eq!(out, ERR.to_vec());
    }

    #[test]
    fn test_parse_error_sends_err() {
        let dir = tempdir().unwrap();
        let mut session = open_session(dir.path(), "10.0.0.5");
        let mut out = Vec::new();
        let term = session.handle_line("'-b' '2014/01/20'\t", &mut out).unwrap();
        assert_eq!(term, Terminator::Close);
        assert_eq!(out, ERR.to_vec());
    }

    #[test]
    fn test_overflowing_duration_sends_err() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let mut session = open_session(dir.path(), "10.0.0.5");

        let mut out = Vec::new();
        let term = session
            .handle_line("'-s' 'US.*' '-b' '2014/01/20 12:00:00' '-d' '1e20'\t", &mut out)
            .unwrap();
        assert_eq!(term, Terminator::Close);
        assert_eq!(out, ERR.to_vec());

        // Representable but past the day limit
        let mut out = Vec::new();
        session
            .handle_line("'-s' 'US.*' '-b' '2014/01/20 12:00:00' '-d' '1e15'\t", &mut out)
            .unwrap();
        assert_eq!(out, ERR.to_vec());
    }

    #[test]
    fn test_metadata_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let mut session = open_session(dir.path(), "10.0.0.5");

        // No station coordinates configured
        let mut out = Vec::new();
        let term = session
            .handle_line(
                "'-s' 'US.*' '-b' '2014/01/20 12:00:00' '-delazc' '0:10:40:-112'\t",
                &mut out,
            )
            .unwrap();
        assert_eq!(term, Terminator::KeepOpen);
        assert_eq!(out.len(), BLOCK_SIZE);
        assert!(out.starts_with(EOR));
    }

    #[test]
    fn test_listings() {
        let dir = tempdir().unwrap();
        store(dir.path());
        let mut session = open_session(dir.path(), "10.0.0.5");

        let mut out = Vec::new();
        session
            .handle_line("'-lsc' '-s' 'USDUG.*' '-b' '2014/01/20' '-d' '1d'\t", &mut out)
            .unwrap();
        let text = String::from_utf8_lossy(&out[..out.len() - EOR.len()]).to_string();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec!["USDUG  BHN00 #days=0001 14020", "USDUG  BHZ00 #days=0001 14020"]
        );

        let mut out = Vec::new();
        session
            .handle_line("'-ls' '-b' '2014/01/20' '-d' '1d'\n", &mut out)
            .unwrap();
        let text = String::from_utf8_lossy(&out).to_string();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("2014_020_CI.idx julian=2456678 node=CI"));
    }

    #[test]
    fn test_realtime_listing() {
        let dir = tempdir().unwrap();
        let session = open_session(dir.path(), "10.0.0.5");
        let block = TimeSeriesBlock::raw(SeedName::new("USDUG  BHZ00"), T0 * 1000, 40.0, vec![1; 40]);
        session.ctx.spans.on_ingest_at(&block, T0);

        let mut session = session;
        let mut out = Vec::new();
        session.handle_line("'-lsrt'\n", &mut out).unwrap();
        let text = String::from_utf8_lossy(&out).to_string();
        assert!(text.starts_with("USDUG  BHZ00 start="), "{}", text);
        assert!(text.contains("nsamp="));
    }

    #[test]
    fn test_realtime_data_request() {
        let dir = tempdir().unwrap();
        let mut session = open_session(dir.path(), "10.0.0.5");
        let samples: Vec<i32> = (0..400).collect();
        for name in ["USDUG  BHZ00", "XXSEC  BHZ00"] {
            let block = TimeSeriesBlock::raw(SeedName::new(name), T0 * 1000, 40.0, samples.clone());
            session.ctx.spans.on_ingest_at(&block, T0);
        }

        let mut out = Vec::new();
        session
            .handle_line("'-s' '.*' '-rt' '-b' '2014/01/20 12:00:00' '-d' '10'\t", &mut out)
            .unwrap();
        assert_eq!(out.len() % BLOCK_SIZE, 0);
        assert!(out[out.len() - BLOCK_SIZE..].starts_with(EOR));

        let headers: Vec<RecordHeader> = out[..out.len() - BLOCK_SIZE]
            .chunks(BLOCK_SIZE)
            .map(|r| RecordHeader::parse(r).unwrap())
            .collect();
        // The restricted station is withheld from an unprivileged peer
        assert!(headers.iter().all(|h| h.seed_name.as_str() == "USDUG  BHZ00"));
        assert_eq!(headers.iter().map(|h| h.nsamp).sum::<usize>(), 400);
        assert_eq!(headers[0].start_micros, T0 * 1000);
        assert_eq!(headers[1].start_micros, T0 * 1000 + 2_800_000);
    }

    #[test]
    fn test_dedup_request() {
        let dir = tempdir().unwrap();
        let dup = record("USDUG  BHZ00", T0, 5);
        let mut writer = IndexFileWriter::create(dir.path(), julian_from_millis(T0), "CI").unwrap();
        for _ in 0..4 {
            writer.append(&dup).unwrap();
        }
        writer.finish().unwrap();
        let mut session = open_session(dir.path(), "10.0.0.5");

        // 5 s at 40 Hz: two entries before duplicates are checked, then one
        // more as the new running maximum, then the fourth copy is dropped
        let mut out = Vec::new();
        session
            .handle_line(
                "'-s' 'USDUG  BHZ00' '-b' '2014/01/20 12:00:00' '-d' '5' '-dedup'\n",
                &mut out,
            )
            .unwrap();
        assert_eq!(out.len(), 3 * BLOCK_SIZE);
    }
}

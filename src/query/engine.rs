//! Disk query engine
//!
//! One engine serves one request at a time and moves through
//!
//! ```text
//! Idle ──set_parameters──► ParametersSet ──query_matches──► Matching
//!   ▲                                                          │
//!   └──────────── reset ◄──── Streaming ◄──────query───────────┘
//! ```
//!
//! `set_parameters` resolves the day range to index files through the
//! directory cache and the shared handle pool. `query_matches` filters each
//! file's channel catalog. `query` walks one channel's index chain extent by
//! extent and hands overlapping records to a [`RecordSink`], or applies the
//! delete protocol to them.

use crate::query::delete::{delete_record, DeleteOutcome, DeleteTombstone, RecordLocation};
use crate::query::error::{QueryError, QueryResult};
use crate::query::filter::{ChannelFilter, ExclusionLists, PrefixRestrictions, RestrictionSource};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::codec::{PlainCodec, SampleCodec};
use crate::storage::directory::FileDirectoryCache;
use crate::storage::error::StorageError;
use crate::storage::index_file::{Extent, IndexFile, EXTENT_BLOCKS, EXTENT_BYTES};
use crate::storage::mseed::{self, RecordHeader, BLOCK_SIZE};
use crate::storage::pool::IndexFilePool;
use crate::storage::types::{format_millis, FileDescriptor, SeedName, TimeRange, MS_PER_DAY};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives the records a query produces
pub trait RecordSink {
    fn record(&mut self, header: &RecordHeader, bytes: &[u8]) -> QueryResult<()>;

    /// A one-block record was deleted
    fn tombstone(&mut self, _tombstone: &DeleteTombstone) -> QueryResult<()> {
        Ok(())
    }
}

impl RecordSink for Vec<Vec<u8>> {
    fn record(&mut self, _header: &RecordHeader, bytes: &[u8]) -> QueryResult<()> {
        self.push(bytes.to_vec());
        Ok(())
    }
}

/// Request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    ParametersSet,
    Matching,
    Streaming,
}

/// Everything `set_parameters` needs
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameters {
    /// Epoch ms, inclusive
    pub begin: i64,
    /// Epoch ms, exclusive
    pub end: i64,
    /// Exclusion list id; `None` selects the default list
    pub exclude: Option<String>,
    pub gaps_only: bool,
    pub allow_deleted: bool,
    /// Listing only: resolve descriptors without opening files
    pub directory_only: bool,
    pub privileged: bool,
    pub show_illegal: bool,
}

impl QueryParameters {
    pub fn new(begin: i64, end: i64) -> Self {
        Self {
            begin,
            end,
            exclude: None,
            gaps_only: false,
            allow_deleted: false,
            directory_only: false,
            privileged: false,
            show_illegal: false,
        }
    }
}

/// Position of one extent in a flattened chain
#[derive(Debug, Clone, Copy)]
struct ExtentRef {
    index_block: u32,
    extent_index: usize,
    extent: Extent,
}

/// A record whose blocks are still being collected
struct PendingRecord {
    header: RecordHeader,
    bytes: Vec<u8>,
    location: RecordLocation,
    remaining: usize,
    wanted: bool,
}

/// State carried while one channel's chain in one file is walked
struct ChainScan<'a> {
    file: &'a dyn IndexFile,
    channel: &'a SeedName,
    range: TimeRange,
    delete: bool,
    allow_deleted: bool,
    carry: Option<PendingRecord>,
    count: usize,
}

pub struct DiskQueryEngine {
    directory: Arc<FileDirectoryCache>,
    pool: Arc<IndexFilePool>,
    restrictions: Arc<dyn RestrictionSource>,
    exclusions: Arc<ExclusionLists>,
    codec: Arc<dyn SampleCodec>,
    buffers: BufferPool,
    max_days: i64,
    max_record_size: usize,
    touch_interval: Duration,

    state: EngineState,
    params: Option<QueryParameters>,
    range: Option<TimeRange>,
    descriptors: Vec<FileDescriptor>,
    files: Vec<Arc<dyn IndexFile>>,
    filter: ChannelFilter,
    channel_days: BTreeMap<SeedName, BTreeSet<i32>>,
    last_touch: Instant,
}

impl DiskQueryEngine {
    pub fn new(directory: Arc<FileDirectoryCache>, pool: Arc<IndexFilePool>) -> Self {
        Self {
            directory,
            pool,
            restrictions: Arc::new(PrefixRestrictions::default()),
            exclusions: Arc::new(ExclusionLists::default()),
            codec: Arc::new(PlainCodec),
            buffers: BufferPool::new(EXTENT_BYTES, 4),
            max_days: 365,
            max_record_size: 65536,
            touch_interval: Duration::from_secs(20),
            state: EngineState::Idle,
            params: None,
            range: None,
            descriptors: Vec::new(),
            files: Vec::new(),
            filter: ChannelFilter::default(),
            channel_days: BTreeMap::new(),
            last_touch: Instant::now(),
        }
    }

    /// Builder: source of public/non-public flags
    pub fn with_restrictions(mut self, restrictions: Arc<dyn RestrictionSource>) -> Self {
        self.restrictions = restrictions;
        self
    }

    /// Builder: named exclusion lists
    pub fn with_exclusions(mut self, exclusions: Arc<ExclusionLists>) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Builder: codec used for delete trims
    pub fn with_codec(mut self, codec: Arc<dyn SampleCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Builder: shared extent buffers; pools of smaller buffers are ignored
    pub fn with_buffers(mut self, buffers: BufferPool) -> Self {
        if buffers.buffer_size() >= EXTENT_BYTES {
            self.buffers = buffers;
        }
        self
    }

    /// Builder: longest request, largest record and handle touch interval
    pub fn with_limits(mut self, max_days: i64, max_record_size: usize, touch_interval: Duration) -> Self {
        self.max_days = max_days;
        self.max_record_size = max_record_size;
        self.touch_interval = touch_interval;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn parameters(&self) -> Option<&QueryParameters> {
        self.params.as_ref()
    }

    /// Descriptors found for the current range, in day order
    pub fn descriptors(&self) -> &[FileDescriptor] {
        &self.descriptors
    }

    /// Files still active for the current request
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Days on which each matched channel appears
    pub fn channel_days(&self) -> &BTreeMap<SeedName, BTreeSet<i32>> {
        &self.channel_days
    }

    /// Drop request state and release handles
    pub fn reset(&mut self) {
        self.state = EngineState::Idle;
        self.params = None;
        self.range = None;
        self.descriptors.clear();
        self.files.clear();
        self.filter = ChannelFilter::default();
        self.channel_days.clear();
    }

    /// Validate the request and open the files covering its days
    pub fn set_parameters(&mut self, params: QueryParameters) -> QueryResult<()> {
        self.reset();

        let range = TimeRange::try_new(params.begin, params.end).ok_or_else(|| {
            QueryError::InvalidTimeRange(format!(
                "end {} precedes begin {}",
                format_millis(params.end),
                format_millis(params.begin)
            ))
        })?;
        let days = (range.duration_millis() + MS_PER_DAY - 1) / MS_PER_DAY;
        if days > self.max_days {
            return Err(QueryError::RangeTooLarge {
                days,
                max: self.max_days,
            });
        }

        self.filter = ChannelFilter {
            privileged: params.privileged,
            show_illegal: params.show_illegal,
            exclusions: self.exclusions.prefixes(params.exclude.as_deref()),
            selected: None,
        };

        for julian in range.julian_days() {
            for desc in self.directory.files_for_day(julian) {
                if params.directory_only {
                    self.descriptors.push(desc);
                    continue;
                }
                match self.pool.get_or_open(&desc) {
                    Ok(handle) => {
                        if let Some(i) = self.files.iter().position(|f| Arc::ptr_eq(f, &handle)) {
                            tracing::warn!(
                                file = ?desc.path,
                                shared_with = ?self.descriptors[i].path,
                                julian,
                                "Partition handle already in this request, skipping"
                            );
                            continue;
                        }
                        self.descriptors.push(desc);
                        self.files.push(handle);
                    }
                    Err(StorageError::TooManyOpenFiles(msg)) => {
                        tracing::error!(file = ?desc.path, julian, error = %msg, "Too many open files");
                        return Err(StorageError::TooManyOpenFiles(msg).into());
                    }
                    Err(e) if e.is_not_found() => {
                        tracing::warn!(file = ?desc.path, julian, "Index file vanished, dropping it");
                        self.directory.delete(julian, &desc.path);
                        self.pool.remove(julian, &desc.node);
                    }
                    Err(e) => {
                        tracing::warn!(file = ?desc.path, julian, error = %e, "Skipping unreadable index file");
                    }
                }
            }
        }

        tracing::debug!(
            begin = %format_millis(range.start),
            end = %format_millis(range.end),
            files = self.descriptors.len(),
            "Query parameters set"
        );
        self.range = Some(range);
        self.params = Some(params);
        self.last_touch = Instant::now();
        self.state = EngineState::ParametersSet;
        Ok(())
    }

    /// Restrict matches to these network+station keys (ring filter result)
    pub fn select_stations(&mut self, stations: Option<HashSet<String>>) {
        self.filter.selected = stations;
    }

    /// Sorted, de-duplicated channels matching `mask` that pass every filter
    ///
    /// Files with no matching channel are dropped from the request.
    pub fn query_matches(&mut self, mask: &str) -> QueryResult<Vec<SeedName>> {
        if self.state == EngineState::Idle {
            return Err(QueryError::Parse("channel match before parameters were set".to_string()));
        }
        let pattern = Regex::new(&format!("^(?:{})$", mask))
            .map_err(|e| QueryError::Parse(format!("bad channel mask '{}': {}", mask, e)))?;

        let mut matched = BTreeSet::new();
        let mut kept = Vec::with_capacity(self.files.len());
        for file in self.files.drain(..) {
            let catalog = match file.channels() {
                Ok(catalog) => catalog,
                Err(e) => {
                    tracing::warn!(file = ?file.descriptor().path, error = %e, "Cannot read channel catalog");
                    continue;
                }
            };

            let mut any = false;
            for entry in catalog {
                if !pattern.is_match(entry.channel.as_str())
                    || !self.filter.admits(&entry.channel, self.restrictions.as_ref())
                {
                    continue;
                }
                any = true;
                self.channel_days
                    .entry(entry.channel.clone())
                    .or_default()
                    .insert(file.julian());
                matched.insert(entry.channel);
            }
            if any {
                kept.push(file);
            }
        }
        self.files = kept;
        self.state = EngineState::Matching;
        Ok(matched.into_iter().collect())
    }

    /// Stream (or delete) one channel's records overlapping the range
    pub fn query(
        &mut self,
        channel: &SeedName,
        sink: &mut dyn RecordSink,
        delete: bool,
    ) -> QueryResult<usize> {
        let (Some(range), Some(params)) = (self.range, self.params.as_ref()) else {
            return Err(QueryError::Parse("query before parameters were set".to_string()));
        };
        let allow_deleted = params.allow_deleted || delete;
        self.state = EngineState::Streaming;

        let files: Vec<Arc<dyn IndexFile>> = self.files.iter().cloned().collect();
        let mut total = 0;
        for file in &files {
            let mut scan = ChainScan {
                file: file.as_ref(),
                channel,
                range,
                delete,
                allow_deleted,
                carry: None,
                count: 0,
            };
            match self.scan_chain(&mut scan, sink) {
                Ok(()) => total += scan.count,
                Err(e) if e.is_fatal() => {
                    tracing::error!(
                        channel = %channel,
                        julian = file.julian(),
                        file = ?file.descriptor().path,
                        error = %e,
                        "Query aborted"
                    );
                    self.state = EngineState::Matching;
                    return Err(e);
                }
                Err(e) => {
                    total += scan.count;
                    tracing::warn!(
                        channel = %channel,
                        julian = file.julian(),
                        file = ?file.descriptor().path,
                        error = %e,
                        "Skipping rest of file"
                    );
                }
            }
        }

        self.state = EngineState::Matching;
        Ok(total)
    }

    fn scan_chain(&mut self, scan: &mut ChainScan<'_>, sink: &mut dyn RecordSink) -> QueryResult<()> {
        let refs = self.extent_chain(scan.file, scan.channel)?;
        let Some(last) = refs.len().checked_sub(1) else {
            return Ok(());
        };

        let mut buf = self.buffers.checkout();
        let mut prev_scanned = false;
        for (i, ext) in refs.iter().enumerate() {
            let wanted = i == last || scan.carry.is_some() || ext.extent.overlaps(&scan.range);
            if !wanted {
                prev_scanned = false;
                continue;
            }

            if i > 0 && !prev_scanned {
                // A record begun in the skipped extent may continue into this one
                let before = &refs[i - 1];
                scan.file
                    .read_extent(before.extent.start_block, &mut buf[..EXTENT_BYTES])?;
                self.scan_extent(scan, before, &buf[..EXTENT_BYTES], false, sink)?;
            }

            scan.file
                .read_extent(ext.extent.start_block, &mut buf[..EXTENT_BYTES])?;
            self.scan_extent(scan, ext, &buf[..EXTENT_BYTES], true, sink)?;
            prev_scanned = true;
            self.touch_if_due();
        }

        if let Some(pending) = scan.carry.take() {
            tracing::warn!(
                channel = %scan.channel,
                julian = scan.file.julian(),
                block = pending.location.blocks.first().copied().unwrap_or_default(),
                missing = pending.remaining,
                "Record truncated at end of index chain"
            );
        }
        Ok(())
    }

    /// Flatten the channel's index chain into extents in chain order
    fn extent_chain(&self, file: &dyn IndexFile, channel: &SeedName) -> QueryResult<Vec<ExtentRef>> {
        let mut refs = Vec::new();
        let mut next = file.first_index_block(channel)?;
        let mut seen = HashSet::new();

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(QueryError::Corruption(format!(
                    "index chain of {} in {:?} loops at block {}",
                    channel,
                    file.descriptor().path,
                    id
                )));
            }
            let block = file.read_index_block(id)?;
            if &block.channel != channel {
                tracing::warn!(
                    channel = %channel,
                    found = %block.channel,
                    julian = file.julian(),
                    block = id,
                    "Index block belongs to another channel, chain ends"
                );
                break;
            }
            refs.extend(block.extents.iter().enumerate().map(|(extent_index, extent)| ExtentRef {
                index_block: id,
                extent_index,
                extent: *extent,
            }));
            next = block.next;
        }
        Ok(refs)
    }

    fn scan_extent(
        &self,
        scan: &mut ChainScan<'_>,
        ext: &ExtentRef,
        buf: &[u8],
        emit: bool,
        sink: &mut dyn RecordSink,
    ) -> QueryResult<()> {
        let mut slot = 0;

        if let Some(mut pending) = scan.carry.take() {
            while slot < EXTENT_BLOCKS && pending.remaining > 0 {
                pending.bytes.extend_from_slice(slot_bytes(buf, slot));
                pending.location.blocks.push(ext.extent.start_block + slot as u32);
                pending.remaining -= 1;
                slot += 1;
            }
            if pending.remaining > 0 {
                scan.carry = Some(pending);
                return Ok(());
            }
            if emit && pending.wanted {
                self.deliver(scan, pending, sink)?;
            }
        }

        while slot < EXTENT_BLOCKS {
            let block = slot_bytes(buf, slot);
            if mseed::is_empty_slot(block) {
                slot += 1;
                continue;
            }

            let header = match RecordHeader::parse(block) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!(
                        channel = %scan.channel,
                        julian = scan.file.julian(),
                        block = ext.extent.start_block + slot as u32,
                        error = %e,
                        "Unparseable record skipped"
                    );
                    slot += 1;
                    continue;
                }
            };

            if &header.seed_name != scan.channel {
                if slot == EXTENT_BLOCKS - 1 {
                    return Err(QueryError::Corruption(format!(
                        "last slot of extent at block {} in {:?} holds {}, expected {}",
                        ext.extent.start_block,
                        scan.file.descriptor().path,
                        header.seed_name,
                        scan.channel
                    )));
                }
                tracing::warn!(
                    channel = %scan.channel,
                    found = %header.seed_name,
                    julian = scan.file.julian(),
                    block = ext.extent.start_block + slot as u32,
                    "Record of another channel in extent, skipped"
                );
                slot += 1;
                continue;
            }

            let mut wanted = emit;
            if header.julian() != scan.file.julian() {
                tracing::warn!(
                    channel = %scan.channel,
                    julian = scan.file.julian(),
                    record_julian = header.julian(),
                    block = ext.extent.start_block + slot as u32,
                    "Record from another day, skipped"
                );
                wanted = false;
            }
            if header.record_length > self.max_record_size {
                tracing::warn!(
                    channel = %scan.channel,
                    julian = scan.file.julian(),
                    length = header.record_length,
                    "Record exceeds maximum size, skipped"
                );
                wanted = false;
            }
            if header.tombstoned && !scan.allow_deleted {
                wanted = false;
            }
            if !scan
                .range
                .overlaps(header.start_millis(), header.end_millis())
            {
                wanted = false;
            }

            let mut pending = PendingRecord {
                bytes: Vec::with_capacity(header.record_length),
                location: RecordLocation {
                    index_block: ext.index_block,
                    extent_index: ext.extent_index,
                    block_in_extent: slot,
                    blocks: Vec::with_capacity(header.blocks()),
                },
                remaining: header.blocks(),
                wanted,
                header,
            };
            while slot < EXTENT_BLOCKS && pending.remaining > 0 {
                pending.bytes.extend_from_slice(slot_bytes(buf, slot));
                pending.location.blocks.push(ext.extent.start_block + slot as u32);
                pending.remaining -= 1;
                slot += 1;
            }
            if pending.remaining > 0 {
                scan.carry = Some(pending);
                return Ok(());
            }
            if pending.wanted {
                self.deliver(scan, pending, sink)?;
            }
        }
        Ok(())
    }

    fn deliver(
        &self,
        scan: &mut ChainScan<'_>,
        mut pending: PendingRecord,
        sink: &mut dyn RecordSink,
    ) -> QueryResult<()> {
        if !scan.delete {
            sink.record(&pending.header, &pending.bytes)?;
            scan.count += 1;
            return Ok(());
        }

        let outcome = delete_record(
            scan.file,
            self.codec.as_ref(),
            &mut pending.bytes,
            &pending.header,
            &pending.location,
            &scan.range,
        );
        match outcome {
            Ok(DeleteOutcome::Tombstoned(Some(tombstone))) => {
                sink.tombstone(&tombstone)?;
                scan.count += 1;
            }
            Ok(DeleteOutcome::Tombstoned(None))
            | Ok(DeleteOutcome::TrimmedLeading(_))
            | Ok(DeleteOutcome::TrimmedTrailing(_)) => scan.count += 1,
            Ok(DeleteOutcome::AlreadyDeleted) | Ok(DeleteOutcome::Untouched) => {}
            Err(QueryError::Codec(e)) => {
                tracing::warn!(
                    channel = %scan.channel,
                    julian = scan.file.julian(),
                    block = pending.location.blocks.first().copied().unwrap_or_default(),
                    error = %e,
                    "Cannot trim record"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Keep the pool from evicting handles during long queries
    fn touch_if_due(&mut self) {
        if self.last_touch.elapsed() < self.touch_interval {
            return;
        }
        for file in &self.files {
            file.touch();
        }
        self.last_touch = Instant::now();
    }
}

fn slot_bytes(extent: &[u8], slot: usize) -> &[u8] {
    &extent[slot * BLOCK_SIZE..(slot + 1) * BLOCK_SIZE]
}

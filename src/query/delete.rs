//! In-place record deletion
//!
//! A delete range is applied to each overlapping record:
//!
//! ```text
//! record:        |=================|
//! range inside:      [---)              → DeleteInsideRecord (fatal)
//! covers start: [--------)              → trim leading samples, rewrite
//! covers end:             [----------)  → trim trailing samples, rewrite
//! covers all:  [------------------------) → tombstone byte 7
//! ```
//!
//! Only one-block records produce a [`DeleteTombstone`] for reuse; larger
//! records are marked but their blocks are not reclaimed.

use crate::query::error::{QueryError, QueryResult};
use crate::storage::codec::SampleCodec;
use crate::storage::index_file::IndexFile;
use crate::storage::mseed::{self, RecordHeader, BLOCK_SIZE};
use crate::storage::types::{format_millis, SeedName, TimeRange};
use std::fmt;

/// Where a record sits in its file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    pub index_block: u32,
    pub extent_index: usize,
    pub block_in_extent: usize,
    /// Data blocks holding the record, in order
    pub blocks: Vec<u32>,
}

/// A freed one-block slot reported back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTombstone {
    pub channel: SeedName,
    pub node: String,
    pub julian: i32,
    pub index_block: u32,
    pub extent_index: usize,
    pub block_in_extent: usize,
    /// Absolute data block
    pub block: u32,
    /// Record start, epoch ms
    pub earliest: i64,
    /// Record end, epoch ms
    pub latest: i64,
}

impl fmt::Display for DeleteTombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DEL {} {} {} iblk={} ext={} slot={} blk={} {} {}",
            self.channel,
            self.node,
            self.julian,
            self.index_block,
            self.extent_index,
            self.block_in_extent,
            self.block,
            format_millis(self.earliest),
            format_millis(self.latest)
        )
    }
}

/// What a delete did to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Marked deleted; one-block records carry a tombstone descriptor
    Tombstoned(Option<DeleteTombstone>),
    /// Marker already present, nothing written
    AlreadyDeleted,
    /// Leading samples removed
    TrimmedLeading(usize),
    /// Trailing samples removed
    TrimmedTrailing(usize),
    /// Record does not overlap the range
    Untouched,
}

/// Apply the delete range to one record and write the changed blocks back
///
/// `record` holds the complete record as read; it is updated to match what
/// was written.
pub fn delete_record(
    file: &dyn IndexFile,
    codec: &dyn SampleCodec,
    record: &mut [u8],
    header: &RecordHeader,
    location: &RecordLocation,
    range: &TimeRange,
) -> QueryResult<DeleteOutcome> {
    let rec_start = header.start_micros;
    let rec_end = header.end_micros();
    let del_start = range.start * 1000;
    let del_end = range.end * 1000;

    if del_start >= rec_end || del_end <= rec_start {
        return Ok(DeleteOutcome::Untouched);
    }
    if header.tombstoned {
        return Ok(DeleteOutcome::AlreadyDeleted);
    }

    let covers_start = del_start <= rec_start;
    let covers_end = del_end >= rec_end;

    match (covers_start, covers_end) {
        (true, true) => tombstone(file, record, header, location),
        (false, false) => Err(QueryError::DeleteInsideRecord {
            channel: header.seed_name.to_string(),
            start: format_millis(header.start_millis()),
        }),
        (true, false) => {
            let drop = samples_before(del_end - rec_start, header.rate).min(header.nsamp);
            if drop >= header.nsamp {
                return tombstone(file, record, header, location);
            }
            let mut samples = decode(codec, record, header)?;
            samples.drain(..drop);
            let new_start = rec_start + (drop as f64 / header.rate * 1_000_000.0).round() as i64;
            rewrite(file, codec, record, header, location, &samples, new_start)?;
            Ok(DeleteOutcome::TrimmedLeading(drop))
        }
        (false, true) => {
            let keep = samples_before(del_start - rec_start, header.rate).min(header.nsamp);
            if keep == 0 {
                return tombstone(file, record, header, location);
            }
            let mut samples = decode(codec, record, header)?;
            samples.truncate(keep);
            rewrite(file, codec, record, header, location, &samples, rec_start)?;
            Ok(DeleteOutcome::TrimmedTrailing(header.nsamp - keep))
        }
    }
}

/// Samples whose time falls in the first `micros` of the record
fn samples_before(micros: i64, rate: f64) -> usize {
    if micros <= 0 || rate <= 0.0 {
        return 0;
    }
    (micros as f64 * rate / 1_000_000.0 - 1e-9).ceil().max(0.0) as usize
}

fn tombstone(
    file: &dyn IndexFile,
    record: &mut [u8],
    header: &RecordHeader,
    location: &RecordLocation,
) -> QueryResult<DeleteOutcome> {
    let first = *location.blocks.first().ok_or_else(|| {
        QueryError::Corruption(format!("record of {} has no block location", header.seed_name))
    })?;
    mseed::mark_tombstone(record);
    file.write_block(first, &record[..BLOCK_SIZE])?;
    tracing::debug!(
        channel = %header.seed_name,
        julian = file.julian(),
        block = first,
        "Record tombstoned"
    );

    if header.record_length != BLOCK_SIZE {
        return Ok(DeleteOutcome::Tombstoned(None));
    }
    Ok(DeleteOutcome::Tombstoned(Some(DeleteTombstone {
        channel: header.seed_name.clone(),
        node: file.node().to_string(),
        julian: file.julian(),
        index_block: location.index_block,
        extent_index: location.extent_index,
        block_in_extent: location.block_in_extent,
        block: first,
        earliest: header.start_millis(),
        latest: header.end_millis(),
    })))
}

fn decode(codec: &dyn SampleCodec, record: &[u8], header: &RecordHeader) -> QueryResult<Vec<i32>> {
    let payload = record
        .get(header.data_offset..header.record_length.min(record.len()))
        .ok_or_else(|| {
            QueryError::Corruption(format!(
                "data offset {} beyond record of {}",
                header.data_offset, header.seed_name
            ))
        })?;
    let mut samples = Vec::with_capacity(header.nsamp);
    codec.decode(
        header.encoding,
        header.data_big_endian,
        payload,
        header.nsamp,
        &mut samples,
    )?;
    Ok(samples)
}

fn rewrite(
    file: &dyn IndexFile,
    codec: &dyn SampleCodec,
    record: &mut [u8],
    header: &RecordHeader,
    location: &RecordLocation,
    samples: &[i32],
    start_micros: i64,
) -> QueryResult<()> {
    let end = header.record_length.min(record.len());
    let payload = &mut record[header.data_offset..end];
    let written = codec.encode(header.encoding, header.data_big_endian, samples, payload)?;
    payload[written..].fill(0);

    mseed::set_start_micros(record, header.header_big_endian, start_micros)?;
    mseed::set_nsamp(record, header.header_big_endian, samples.len())?;

    for (i, &block) in location.blocks.iter().enumerate() {
        let from = i * BLOCK_SIZE;
        if from + BLOCK_SIZE > record.len() {
            break;
        }
        file.write_block(block, &record[from..from + BLOCK_SIZE])?;
    }
    tracing::debug!(
        channel = %header.seed_name,
        julian = file.julian(),
        nsamp = samples.len(),
        "Record trimmed"
    );
    Ok(())
}

//! Index file contract and the reference on-disk implementation
//!
//! Each day/node partition is a pair of files sharing a stem:
//! `YYYY_DDD_NODE.idx` (catalog) and `YYYY_DDD_NODE.ms` (data records in
//! 512-byte blocks, allocated to channels in extents of 64 blocks).
//!
//! Index file layout, all integers little-endian, 512-byte blocks:
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ BLOCK 0: HEADER                            │
//! │   magic: [u8; 4] = "WVIX"                  │
//! │   version: u16                             │
//! │   julian: i32                              │
//! │   node: [u8; 4]                            │
//! │   master_count: u16                        │
//! │   index_count: u32                         │
//! │   data_blocks: u32                         │
//! │   checksum: u32 (at 508)                   │
//! ├────────────────────────────────────────────┤
//! │ BLOCKS 1..=master_count: MASTER BLOCKS     │
//! │   entries: u16, then 24-byte entries       │
//! │   channel[12] first_index i32 last i32     │
//! ├────────────────────────────────────────────┤
//! │ INDEX BLOCKS (chained per channel)         │
//! │   channel[12] next i32 nextents u16        │
//! │   extents: start_block i32,                │
//! │            earliest i64, latest i64 (ms)   │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The query engine only talks to the [`IndexFile`] trait; the handle pool
//! obtains handles through an [`IndexFileOpener`].

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::mseed::{RecordHeader, BLOCK_SIZE};
use crate::storage::types::{FileDescriptor, SeedName, TimeRange};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};

/// Blocks per extent
pub const EXTENT_BLOCKS: usize = 64;

/// Bytes per extent
pub const EXTENT_BYTES: usize = EXTENT_BLOCKS * BLOCK_SIZE;

/// Magic bytes for index file identification
const INDEX_MAGIC: [u8; 4] = *b"WVIX";

/// Current index format version
const INDEX_VERSION: u16 = 1;

const MASTER_ENTRY_LEN: usize = 24;
const MASTER_ENTRIES_PER_BLOCK: usize = (BLOCK_SIZE - 4) / MASTER_ENTRY_LEN;

const EXTENT_ENTRY_LEN: usize = 20;
const INDEX_HEADER_LEN: usize = 20;

/// Extents referenced by one index block
pub const EXTENTS_PER_INDEX: usize = (BLOCK_SIZE - INDEX_HEADER_LEN) / EXTENT_ENTRY_LEN;

/// One channel's entry in the master block catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEntry {
    pub channel: SeedName,
    pub first_index: u32,
    pub last_index: u32,
}

/// A 64-block region of the data file owned by one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First data block of the extent
    pub start_block: u32,
    /// Earliest record start in the extent, epoch ms
    pub earliest: i64,
    /// Latest record end in the extent, epoch ms
    pub latest: i64,
}

impl Extent {
    /// An extent allocated but not yet holding any record
    pub fn undated(start_block: u32) -> Self {
        Self {
            start_block,
            earliest: i64::MAX,
            latest: i64::MIN,
        }
    }

    pub fn is_dated(&self) -> bool {
        self.earliest <= self.latest
    }

    /// Whether the extent's dated window overlaps `range`
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.is_dated() && self.earliest < range.end && self.latest >= range.start
    }

    fn widen(&mut self, start: i64, end: i64) {
        self.earliest = self.earliest.min(start);
        self.latest = self.latest.max(end);
    }
}

/// One link of a channel's index chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub id: u32,
    pub channel: SeedName,
    pub next: Option<u32>,
    pub extents: Vec<Extent>,
}

/// Read/write access to one day/node partition
pub trait IndexFile: Send + Sync {
    fn descriptor(&self) -> &FileDescriptor;

    fn julian(&self) -> i32 {
        self.descriptor().julian
    }

    fn node(&self) -> &str {
        &self.descriptor().node
    }

    /// Snapshot of the master block catalog
    fn channels(&self) -> StorageResult<Vec<MasterEntry>>;

    /// First index block of a channel's chain, if the channel is in this file
    fn first_index_block(&self, channel: &SeedName) -> StorageResult<Option<u32>> {
        Ok(self
            .channels()?
            .into_iter()
            .find(|e| &e.channel == channel)
            .map(|e| e.first_index))
    }

    fn read_index_block(&self, id: u32) -> StorageResult<IndexBlock>;

    /// Read one extent into `buf` (`EXTENT_BYTES` long); unwritten tail reads as zeros
    fn read_extent(&self, start_block: u32, buf: &mut [u8]) -> StorageResult<()>;

    /// Overwrite one data block in place
    fn write_block(&self, block: u32, data: &[u8]) -> StorageResult<()>;

    /// Mark the handle as in use
    fn touch(&self);

    fn last_used(&self) -> Instant;
}

/// Produces handles for descriptors found by the directory cache
pub trait IndexFileOpener: Send + Sync {
    fn open(&self, desc: &FileDescriptor) -> StorageResult<Arc<dyn IndexFile>>;
}

/// Opens [`DiskIndexFile`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskOpener;

impl IndexFileOpener for DiskOpener {
    fn open(&self, desc: &FileDescriptor) -> StorageResult<Arc<dyn IndexFile>> {
        Ok(Arc::new(DiskIndexFile::open(desc.clone())?))
    }
}

struct MasterCache {
    modified: Option<SystemTime>,
    entries: Vec<MasterEntry>,
}

/// Index/data file pair on local disk
pub struct DiskIndexFile {
    desc: FileDescriptor,
    index: Mutex<File>,
    data: Mutex<File>,
    writable: bool,
    master: Mutex<MasterCache>,
    last_used: Mutex<Instant>,
}

impl DiskIndexFile {
    /// Open an existing pair and load its catalog
    pub fn open(desc: FileDescriptor) -> StorageResult<Self> {
        let index = File::open(&desc.path)?;
        let data_path = desc.data_path();
        let (data, writable) = match OpenOptions::new().read(true).write(true).open(&data_path) {
            Ok(f) => (f, true),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                tracing::debug!(file = ?data_path, "Data file is read-only");
                (File::open(&data_path)?, false)
            }
            Err(e) => return Err(e.into()),
        };

        let file = Self {
            desc,
            index: Mutex::new(index),
            data: Mutex::new(data),
            writable,
            master: Mutex::new(MasterCache {
                modified: None,
                entries: Vec::new(),
            }),
            last_used: Mutex::new(Instant::now()),
        };
        file.refresh_master()?;
        Ok(file)
    }

    /// Re-read the master blocks if the index file changed on disk
    fn refresh_master(&self) -> StorageResult<Vec<MasterEntry>> {
        let modified = std::fs::metadata(&self.desc.path)?.modified().ok();
        let mut cache = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.modified.is_some() && cache.modified == modified {
            return Ok(cache.entries.clone());
        }

        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let header = read_block(&mut index, 0)?;
        let master_count = parse_header(&header, &self.desc)?;

        let mut entries = Vec::new();
        for block in 1..=master_count as u32 {
            let buf = read_block(&mut index, block)?;
            let count = (u16::from_le_bytes([buf[0], buf[1]]) as usize).min(MASTER_ENTRIES_PER_BLOCK);
            for i in 0..count {
                let base = 4 + i * MASTER_ENTRY_LEN;
                entries.push(MasterEntry {
                    channel: SeedName::from_bytes(&buf[base..base + 12]),
                    first_index: read_i32(&buf, base + 12) as u32,
                    last_index: read_i32(&buf, base + 16) as u32,
                });
            }
        }

        cache.modified = modified;
        cache.entries = entries.clone();
        Ok(entries)
    }

    fn mark_used(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

impl IndexFile for DiskIndexFile {
    fn descriptor(&self) -> &FileDescriptor {
        &self.desc
    }

    fn channels(&self) -> StorageResult<Vec<MasterEntry>> {
        self.mark_used();
        self.refresh_master()
    }

    fn read_index_block(&self, id: u32) -> StorageResult<IndexBlock> {
        let buf = {
            let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            read_block(&mut index, id)?
        };

        let next = read_i32(&buf, 12);
        let count = u16::from_le_bytes([buf[16], buf[17]]) as usize;
        if count > EXTENTS_PER_INDEX {
            return Err(StorageError::Corruption(format!(
                "index block {} of {:?} claims {} extents",
                id, self.desc.path, count
            )));
        }

        let extents = (0..count)
            .map(|i| {
                let base = INDEX_HEADER_LEN + i * EXTENT_ENTRY_LEN;
                Extent {
                    start_block: read_i32(&buf, base) as u32,
                    earliest: read_i64(&buf, base + 4),
                    latest: read_i64(&buf, base + 12),
                }
            })
            .collect();

        Ok(IndexBlock {
            id,
            channel: SeedName::from_bytes(&buf[0..12]),
            next: if next < 0 { None } else { Some(next as u32) },
            extents,
        })
    }

    fn read_extent(&self, start_block: u32, buf: &mut [u8]) -> StorageResult<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.seek(SeekFrom::Start(start_block as u64 * BLOCK_SIZE as u64))?;

        let mut filled = 0;
        while filled < buf.len() {
            match data.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_block(&self, block: u32, bytes: &[u8]) -> StorageResult<()> {
        if !self.writable {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{:?} is read-only", self.desc.data_path()),
            )));
        }
        if bytes.len() != BLOCK_SIZE {
            return Err(StorageError::InvalidRecord(format!(
                "block write of {} bytes",
                bytes.len()
            )));
        }

        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        data.write_all(bytes)?;
        data.flush()?;
        Ok(())
    }

    fn touch(&self) {
        self.mark_used();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WriterChain {
    /// Positions in `IndexFileWriter::index_blocks`
    links: Vec<usize>,
    /// Start block and used slots of the extent being filled
    current: Option<(u32, usize)>,
}

struct PendingIndex {
    channel: SeedName,
    next: Option<usize>,
    extents: Vec<Extent>,
}

/// Builds a fresh index/data file pair
///
/// Records are laid out block by block in each channel's extents, so a
/// record larger than one block may continue in the channel's next extent.
pub struct IndexFileWriter {
    desc: FileDescriptor,
    chains: BTreeMap<SeedName, WriterChain>,
    index_blocks: Vec<PendingIndex>,
    data: Vec<u8>,
}

impl IndexFileWriter {
    /// Start a new partition in `dir`
    pub fn create(dir: &Path, julian: i32, node: &str) -> StorageResult<Self> {
        let name = FileDescriptor::file_name(julian, node)
            .ok_or_else(|| StorageError::Config(format!("julian day {} out of range", julian)))?;
        let desc = FileDescriptor::from_path(dir.join(name))?;
        Ok(Self {
            desc,
            chains: BTreeMap::new(),
            index_blocks: Vec::new(),
            data: Vec::new(),
        })
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.desc
    }

    /// Append one complete record
    pub fn append(&mut self, record: &[u8]) -> StorageResult<()> {
        let header = RecordHeader::parse(record)?;
        if record.len() != header.record_length || record.len() % BLOCK_SIZE != 0 {
            return Err(StorageError::InvalidRecord(format!(
                "record of {} bytes declares length {}",
                record.len(),
                header.record_length
            )));
        }

        let (start, end) = (header.start_millis(), header.end_millis());
        for block in record.chunks_exact(BLOCK_SIZE) {
            let (extent_pos, slot_block) = self.allocate(&header.seed_name);
            let offset = slot_block as usize * BLOCK_SIZE;
            self.data[offset..offset + BLOCK_SIZE].copy_from_slice(block);

            let (index_pos, extent_idx) = extent_pos;
            self.index_blocks[index_pos].extents[extent_idx].widen(start, end);
        }
        Ok(())
    }

    /// Next free block for `channel`; returns ((index position, extent index), block)
    fn allocate(&mut self, channel: &SeedName) -> ((usize, usize), u32) {
        let chain = self
            .chains
            .entry(channel.clone())
            .or_insert_with(|| WriterChain {
                links: Vec::new(),
                current: None,
            });

        let need_extent = match chain.current {
            Some((_, used)) => used >= EXTENT_BLOCKS,
            None => true,
        };

        if need_extent {
            let start_block = (self.data.len() / BLOCK_SIZE) as u32;
            self.data.resize(self.data.len() + EXTENT_BYTES, 0);

            let last_full = chain
                .links
                .last()
                .map(|&pos| self.index_blocks[pos].extents.len() >= EXTENTS_PER_INDEX)
                .unwrap_or(true);
            if last_full {
                let pos = self.index_blocks.len();
                self.index_blocks.push(PendingIndex {
                    channel: channel.clone(),
                    next: None,
                    extents: Vec::new(),
                });
                if let Some(&prev) = chain.links.last() {
                    self.index_blocks[prev].next = Some(pos);
                }
                chain.links.push(pos);
            }

            if let Some(&pos) = chain.links.last() {
                self.index_blocks[pos].extents.push(Extent::undated(start_block));
            }
            chain.current = Some((start_block, 0));
        }

        let index_pos = chain.links.last().copied().unwrap_or_default();
        let extent_idx = self.index_blocks[index_pos].extents.len().saturating_sub(1);
        let (start_block, used) = chain.current.unwrap_or((0, 0));
        chain.current = Some((start_block, used + 1));
        ((index_pos, extent_idx), start_block + used as u32)
    }

    /// Write both files and return the descriptor of the new partition
    pub fn finish(self) -> StorageResult<FileDescriptor> {
        let master_count = self.chains.len().div_ceil(MASTER_ENTRIES_PER_BLOCK).max(1);
        let first_index_id = 1 + master_count;
        let id_of = |pos: usize| (first_index_id + pos) as i32;

        let mut out = Vec::with_capacity((first_index_id + self.index_blocks.len()) * BLOCK_SIZE);

        let mut header = [0u8; BLOCK_SIZE];
        header[0..4].copy_from_slice(&INDEX_MAGIC);
        header[4..6].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        header[6..10].copy_from_slice(&self.desc.julian.to_le_bytes());
        let mut node = [b' '; 4];
        for (dst, src) in node.iter_mut().zip(self.desc.node.bytes()) {
            *dst = src;
        }
        header[10..14].copy_from_slice(&node);
        header[14..16].copy_from_slice(&(master_count as u16).to_le_bytes());
        header[16..20].copy_from_slice(&(self.index_blocks.len() as u32).to_le_bytes());
        header[20..24].copy_from_slice(&((self.data.len() / BLOCK_SIZE) as u32).to_le_bytes());
        let checksum = crc32fast::hash(&header[0..508]);
        header[508..512].copy_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&header);

        let entries: Vec<(&SeedName, &WriterChain)> = self.chains.iter().collect();
        for m in 0..master_count {
            let mut block = [0u8; BLOCK_SIZE];
            let chunk = entries
                .iter()
                .skip(m * MASTER_ENTRIES_PER_BLOCK)
                .take(MASTER_ENTRIES_PER_BLOCK);
            let mut count = 0u16;
            for (i, (name, chain)) in chunk.enumerate() {
                let base = 4 + i * MASTER_ENTRY_LEN;
                block[base..base + 12].copy_from_slice(name.as_str().as_bytes());
                let first = chain.links.first().copied().map(id_of).unwrap_or(-1);
                let last = chain.links.last().copied().map(id_of).unwrap_or(-1);
                block[base + 12..base + 16].copy_from_slice(&first.to_le_bytes());
                block[base + 16..base + 20].copy_from_slice(&last.to_le_bytes());
                count += 1;
            }
            block[0..2].copy_from_slice(&count.to_le_bytes());
            out.extend_from_slice(&block);
        }

        for pending in &self.index_blocks {
            let mut block = [0u8; BLOCK_SIZE];
            block[0..12].copy_from_slice(pending.channel.as_str().as_bytes());
            let next = pending.next.map(id_of).unwrap_or(-1);
            block[12..16].copy_from_slice(&next.to_le_bytes());
            block[16..18].copy_from_slice(&(pending.extents.len() as u16).to_le_bytes());
            for (i, extent) in pending.extents.iter().enumerate() {
                let base = INDEX_HEADER_LEN + i * EXTENT_ENTRY_LEN;
                block[base..base + 4].copy_from_slice(&(extent.start_block as i32).to_le_bytes());
                block[base + 4..base + 12].copy_from_slice(&extent.earliest.to_le_bytes());
                block[base + 12..base + 20].copy_from_slice(&extent.latest.to_le_bytes());
            }
            out.extend_from_slice(&block);
        }

        if let Some(parent) = self.desc.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(self.desc.data_path(), &self.data)?;
        std::fs::write(&self.desc.path, &out)?;

        tracing::debug!(
            file = ?self.desc.path,
            channels = self.chains.len(),
            index_blocks = self.index_blocks.len(),
            "Wrote index file"
        );
        Ok(self.desc)
    }
}

fn read_block(file: &mut File, block: u32) -> StorageResult<[u8; BLOCK_SIZE]> {
    let mut buf = [0u8; BLOCK_SIZE];
    file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Validate the header block and return the master block count
fn parse_header(buf: &[u8; BLOCK_SIZE], desc: &FileDescriptor) -> StorageResult<u16> {
    let stored = u32::from_le_bytes([buf[508], buf[509], buf[510], buf[511]]);
    let computed = crc32fast::hash(&buf[0..508]);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "header checksum mismatch in {:?}: stored={}, computed={}",
            desc.path, stored, computed
        )));
    }
    if buf[0..4] != INDEX_MAGIC {
        return Err(StorageError::Corruption(format!(
            "invalid magic in {:?}",
            desc.path
        )));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version > INDEX_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported index version {} in {:?}",
            version, desc.path
        )));
    }
    let julian = read_i32(buf, 6);
    if julian != desc.julian {
        return Err(StorageError::Corruption(format!(
            "{:?} holds julian day {}, name says {}",
            desc.path, julian, desc.julian
        )));
    }
    Ok(u16::from_le_bytes([buf[14], buf[15]]))
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mseed::RecordBuilder;
    use crate::storage::types::julian_from_year_doy;
    use tempfile::tempdir;

    // 2014-01-20 12:00:00 UTC
    const T0_MS: i64 = 1_390_219_200_000;

    fn record(name: &str, start_ms: i64, fill: i32) -> Vec<u8> {
        RecordBuilder::new(SeedName::new(name), start_ms * 1000, 40.0)
            .build(&[fill; 100])
            .unwrap()
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let julian = julian_from_year_doy(2014, 20).unwrap();
        let mut writer = IndexFileWriter::create(dir.path(), julian, "CI").unwrap();
        for i in 0..3 {
            writer
                .append(&record("USDUG  BHZ00", T0_MS + i * 2500, i as i32))
                .unwrap();
            writer
                .append(&record("USDUG  BHN00", T0_MS + i * 2500, 10 + i as i32))
                .unwrap();
        }
        let desc = writer.finish().unwrap();

        let file = DiskIndexFile::open(desc).unwrap();
        let channels = file.channels().unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel, SeedName::new("USDUG  BHN00"));

        let first = file
            .first_index_block(&SeedName::new("USDUG  BHZ00"))
            .unwrap()
            .unwrap();
        let block = file.read_index_block(first).unwrap();
        assert_eq!(block.channel, SeedName::new("USDUG  BHZ00"));
        assert_eq!(block.next, None);
        assert_eq!(block.extents.len(), 1);
        assert_eq!(block.extents[0].earliest, T0_MS);
        assert_eq!(block.extents[0].latest, T0_MS + 2 * 2500 + 2500);

        let mut buf = vec![0u8; EXTENT_BYTES];
        file.read_extent(block.extents[0].start_block, &mut buf).unwrap();
        let header = RecordHeader::parse(&buf[BLOCK_SIZE..]).unwrap();
        assert_eq!(header.start_millis(), T0_MS + 2500);
        assert!(crate::storage::mseed::is_empty_slot(&buf[3 * BLOCK_SIZE..]));
    }

    #[test]
    fn test_chain_spans_index_blocks() {
        let dir = tempdir().unwrap();
        let julian = julian_from_year_doy(2014, 20).unwrap();
        let mut writer = IndexFileWriter::create(dir.path(), julian, "CI").unwrap();
        let total = EXTENT_BLOCKS * (EXTENTS_PER_INDEX + 1);
        for i in 0..total as i64 {
            writer.append(&record("USDUG  BHZ00", T0_MS + i * 2500, 0)).unwrap();
        }
        let desc = writer.finish().unwrap();
        let file = DiskIndexFile::open(desc).unwrap();

        let first = file
            .first_index_block(&SeedName::new("USDUG  BHZ00"))
            .unwrap()
            .unwrap();
        let block = file.read_index_block(first).unwrap();
        assert_eq!(block.extents.len(), EXTENTS_PER_INDEX);
        let next = file.read_index_block(block.next.unwrap()).unwrap();
        assert_eq!(next.extents.len(), 1);
        assert_eq!(next.next, None);
    }

    #[test]
    fn test_write_block_in_place() {
        let dir = tempdir().unwrap();
        let julian = julian_from_year_doy(2014, 20).unwrap();
        let mut writer = IndexFileWriter::create(dir.path(), julian, "CI").unwrap();
        writer.append(&record("USDUG  BHZ00", T0_MS, 5)).unwrap();
        let desc = writer.finish().unwrap();
        let file = DiskIndexFile::open(desc).unwrap();

        let mut rec = record("USDUG  BHZ00", T0_MS, 5);
        crate::storage::mseed::mark_tombstone(&mut rec);
        file.write_block(0, &rec).unwrap();

        let mut buf = vec![0u8; EXTENT_BYTES];
        file.read_extent(0, &mut buf).unwrap();
        assert!(crate::storage::mseed::is_tombstoned(&buf));
        assert!(file.write_block(0, &rec[..100]).is_err());
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = tempdir().unwrap();
        let julian = julian_from_year_doy(2014, 20).unwrap();
        let mut writer = IndexFileWriter::create(dir.path(), julian, "CI").unwrap();
        writer.append(&record("USDUG  BHZ00", T0_MS, 5)).unwrap();
        let desc = writer.finish().unwrap();

        let mut bytes = std::fs::read(&desc.path).unwrap();
        bytes[6] ^= 0xff;
        std::fs::write(&desc.path, bytes).unwrap();
        assert!(matches!(
            DiskIndexFile::open(desc),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_extent_overlap() {
        let range = TimeRange::try_new(1000, 2000).unwrap();
        assert!(!Extent::undated(0).overlaps(&range));
        let extent = Extent {
            start_block: 0,
            earliest: 1500,
            latest: 2500,
        };
        assert!(extent.overlaps(&range));
    }
}

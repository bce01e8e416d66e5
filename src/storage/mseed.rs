//! MiniSEED record header access
//!
//! Data records are stored byte-exact on disk and served byte-exact to
//! clients, so this module only reads and patches headers in place. Layout
//! of the 48-byte fixed header:
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ 0..6     │ sequence number (ASCII)                   │
//! │ 6        │ quality indicator                         │
//! │ 7        │ reserved (tombstone marker when deleted)  │
//! │ 8..13    │ station                                   │
//! │ 13..15   │ location                                  │
//! │ 15..18   │ channel                                   │
//! │ 18..20   │ network                                   │
//! │ 20..30   │ BTIME start (year, doy, h, m, s, -, 1e-4s)│
//! │ 30..32   │ number of samples                         │
//! │ 32..36   │ rate factor, rate multiplier              │
//! │ 36..40   │ flags, number of blockettes               │
//! │ 40..44   │ time correction                           │
//! │ 44..46   │ offset of first data byte                 │
//! │ 46..48   │ offset of first blockette                 │
//! └──────────┴──────────────────────────────────────────┘
//! ```
//!
//! Blockette 1000 carries the encoding, data word order and the record length
//! as a power of two.

use crate::storage::codec::{encoding, PlainCodec, SampleCodec};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{julian_from_millis, SeedName};
use chrono::{DateTime, Datelike, NaiveDate, Timelike};

/// Size of one on-disk block; also the smallest record size
pub const BLOCK_SIZE: usize = 512;

/// Fixed header length
pub const FIXED_HEADER_LEN: usize = 48;

/// Byte written at offset 7 when a record is deleted
pub const TOMBSTONE: u8 = b'~';

/// Offset of the tombstone marker
pub const TOMBSTONE_OFFSET: usize = 7;

/// Largest number of blockettes walked before giving up on a chain
const MAX_BLOCKETTES: usize = 16;

/// Parsed view of a record's fixed header and blockette 1000
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub seed_name: SeedName,
    pub quality: u8,
    /// Start time, epoch microseconds
    pub start_micros: i64,
    pub nsamp: usize,
    pub rate: f64,
    pub data_offset: usize,
    pub encoding: u8,
    /// Byte order of the fixed header fields
    pub header_big_endian: bool,
    /// Byte order of the data payload
    pub data_big_endian: bool,
    pub record_length: usize,
    pub tombstoned: bool,
}

impl RecordHeader {
    /// Parse the header at the front of `buf`
    pub fn parse(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(StorageError::InvalidRecord(format!(
                "record shorter than fixed header: {} bytes",
                buf.len()
            )));
        }

        let header_big_endian = detect_byte_order(buf)?;
        let u16_at = |off: usize| read_u16(buf, off, header_big_endian);

        let start_micros = decode_btime(buf, header_big_endian)?;
        let nsamp = u16_at(30) as usize;
        let rate = rate_from_factors(u16_at(32) as i16, u16_at(34) as i16);
        let data_offset = u16_at(44) as usize;

        let mut encoding = encoding::INT32;
        let mut data_big_endian = true;
        let mut record_length = BLOCK_SIZE;

        let mut next = u16_at(46) as usize;
        let mut walked = 0;
        while next >= FIXED_HEADER_LEN && next + 8 <= buf.len() && walked < MAX_BLOCKETTES {
            let kind = u16_at(next);
            if kind == 1000 {
                encoding = buf[next + 4];
                data_big_endian = buf[next + 5] == 1;
                let exponent = buf[next + 6];
                if !(8..=20).contains(&exponent) {
                    return Err(StorageError::InvalidRecord(format!(
                        "record length exponent {} out of range",
                        exponent
                    )));
                }
                record_length = 1usize << exponent;
                break;
            }
            let following = u16_at(next + 2) as usize;
            if following <= next {
                break;
            }
            next = following;
            walked += 1;
        }

        Ok(Self {
            seed_name: seed_name_of(buf),
            quality: buf[6],
            start_micros,
            nsamp,
            rate,
            data_offset,
            encoding,
            header_big_endian,
            data_big_endian,
            record_length,
            tombstoned: buf[TOMBSTONE_OFFSET] == TOMBSTONE,
        })
    }

    /// Start time, epoch milliseconds
    pub fn start_millis(&self) -> i64 {
        self.start_micros.div_euclid(1000)
    }

    /// Time just after the last sample, epoch microseconds
    pub fn end_micros(&self) -> i64 {
        if self.rate <= 0.0 {
            return self.start_micros;
        }
        self.start_micros + (self.nsamp as f64 / self.rate * 1_000_000.0).round() as i64
    }

    /// Time just after the last sample, epoch milliseconds
    pub fn end_millis(&self) -> i64 {
        self.end_micros().div_euclid(1000)
    }

    /// Julian day of the first sample
    pub fn julian(&self) -> i32 {
        julian_from_millis(self.start_millis())
    }

    /// Number of 512-byte blocks the record occupies
    pub fn blocks(&self) -> usize {
        self.record_length.div_ceil(BLOCK_SIZE).max(1)
    }
}

/// An all-zero leading slot has never been written
pub fn is_empty_slot(buf: &[u8]) -> bool {
    buf.len() < 8 || buf[..8].iter().all(|&b| b == 0)
}

/// Whether the record carries the tombstone marker
pub fn is_tombstoned(buf: &[u8]) -> bool {
    buf.get(TOMBSTONE_OFFSET) == Some(&TOMBSTONE)
}

/// Place the tombstone marker; idempotent
pub fn mark_tombstone(buf: &mut [u8]) {
    if let Some(b) = buf.get_mut(TOMBSTONE_OFFSET) {
        *b = TOMBSTONE;
    }
}

/// Channel name embedded in the record (bytes 8..20 reordered to NNSSSSSCCCLL)
pub fn seed_name_of(buf: &[u8]) -> SeedName {
    let mut name = [b' '; SeedName::LEN];
    if buf.len() >= 20 {
        name[0..2].copy_from_slice(&buf[18..20]);
        name[2..7].copy_from_slice(&buf[8..13]);
        name[7..10].copy_from_slice(&buf[15..18]);
        name[10..12].copy_from_slice(&buf[13..15]);
    }
    SeedName::from_bytes(&name)
}

/// Overwrite the BTIME start field
pub fn set_start_micros(buf: &mut [u8], big_endian: bool, micros: i64) -> StorageResult<()> {
    let dt = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::InvalidRecord(format!("time {} out of range", micros)))?;
    let frac = (micros.rem_euclid(1_000_000) / 100) as u16;
    write_u16(buf, 20, dt.year() as u16, big_endian);
    write_u16(buf, 22, dt.ordinal() as u16, big_endian);
    buf[24] = dt.hour() as u8;
    buf[25] = dt.minute() as u8;
    buf[26] = dt.second() as u8;
    buf[27] = 0;
    write_u16(buf, 28, frac, big_endian);
    Ok(())
}

/// Overwrite the sample count
pub fn set_nsamp(buf: &mut [u8], big_endian: bool, nsamp: usize) -> StorageResult<()> {
    let n = u16::try_from(nsamp)
        .map_err(|_| StorageError::InvalidRecord(format!("{} samples exceed a record", nsamp)))?;
    write_u16(buf, 30, n, big_endian);
    Ok(())
}

/// Builds INT32 records; used by the importer, the delete trimmer and tests
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    seed_name: SeedName,
    start_micros: i64,
    rate: f64,
    record_length: usize,
    sequence: u32,
}

impl RecordBuilder {
    pub fn new(seed_name: SeedName, start_micros: i64, rate: f64) -> Self {
        Self {
            seed_name,
            start_micros,
            rate,
            record_length: BLOCK_SIZE,
            sequence: 1,
        }
    }

    /// Builder: record length, must be a power of two of at least 256
    pub fn record_length(mut self, len: usize) -> Self {
        self.record_length = len;
        self
    }

    /// Builder: sequence number
    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence % 1_000_000;
        self
    }

    /// Samples that fit in one record of this length
    pub fn capacity(&self) -> usize {
        self.record_length.saturating_sub(64) / 4
    }

    /// Serialize `samples` into a complete record
    pub fn build(&self, samples: &[i32]) -> StorageResult<Vec<u8>> {
        if !self.record_length.is_power_of_two() || self.record_length < 256 {
            return Err(StorageError::InvalidRecord(format!(
                "record length {} is not a power of two >= 256",
                self.record_length
            )));
        }

        let mut buf = vec![0u8; self.record_length];
        buf[0..6].copy_from_slice(format!("{:06}", self.sequence).as_bytes());
        buf[6] = b'D';
        buf[7] = b' ';

        let name = self.seed_name.as_str().as_bytes();
        buf[8..13].copy_from_slice(&name[2..7]);
        buf[13..15].copy_from_slice(&name[10..12]);
        buf[15..18].copy_from_slice(&name[7..10]);
        buf[18..20].copy_from_slice(&name[0..2]);

        set_start_micros(&mut buf, true, self.start_micros)?;
        set_nsamp(&mut buf, true, samples.len())?;
        let (factor, multiplier) = factors_from_rate(self.rate);
        write_u16(&mut buf, 32, factor as u16, true);
        write_u16(&mut buf, 34, multiplier as u16, true);
        buf[39] = 1;
        write_u16(&mut buf, 44, 64, true);
        write_u16(&mut buf, 46, 48, true);

        // Blockette 1000
        write_u16(&mut buf, 48, 1000, true);
        write_u16(&mut buf, 50, 0, true);
        buf[52] = encoding::INT32;
        buf[53] = 1;
        buf[54] = self.record_length.trailing_zeros() as u8;

        let written = PlainCodec.encode(encoding::INT32, true, samples, &mut buf[64..])?;
        debug_assert_eq!(written, samples.len() * 4);
        Ok(buf)
    }
}

/// Convert SEED rate factor/multiplier to samples per second
pub fn rate_from_factors(factor: i16, multiplier: i16) -> f64 {
    let f = factor as f64;
    let m = if multiplier == 0 { 1.0 } else { multiplier as f64 };
    match (factor > 0, m > 0.0) {
        _ if factor == 0 => 0.0,
        (true, true) => f * m,
        (true, false) => -f / m,
        (false, true) => -m / f,
        (false, false) => 1.0 / (f * m),
    }
}

/// Inverse of [`rate_from_factors`] for the rates a builder is asked for
pub fn factors_from_rate(rate: f64) -> (i16, i16) {
    if rate <= 0.0 {
        (0, 0)
    } else if rate >= 1.0 && (rate - rate.round()).abs() < 1e-9 {
        (rate.round() as i16, 1)
    } else if rate >= 1.0 {
        ((rate * 100.0).round() as i16, -100)
    } else {
        (-((1.0 / rate).round() as i16), 1)
    }
}

fn detect_byte_order(buf: &[u8]) -> StorageResult<bool> {
    let plausible = |year: u16| (1900..=2100).contains(&year);
    if plausible(read_u16(buf, 20, true)) {
        Ok(true)
    } else if plausible(read_u16(buf, 20, false)) {
        Ok(false)
    } else {
        Err(StorageError::InvalidRecord(format!(
            "implausible start year in header of {}",
            seed_name_of(buf)
        )))
    }
}

fn decode_btime(buf: &[u8], big_endian: bool) -> StorageResult<i64> {
    let year = read_u16(buf, 20, big_endian) as i32;
    let doy = read_u16(buf, 22, big_endian) as u32;
    let (hour, minute, second) = (buf[24] as i64, buf[25] as i64, buf[26] as i64);
    let frac = read_u16(buf, 28, big_endian) as i64;

    let date = NaiveDate::from_yo_opt(year, doy).ok_or_else(|| {
        StorageError::InvalidRecord(format!("invalid start date {}/{:03}", year, doy))
    })?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| StorageError::InvalidRecord("invalid start date".to_string()))?
        .and_utc()
        .timestamp_micros();

    Ok(midnight + ((hour * 60 + minute) * 60 + second) * 1_000_000 + frac * 100)
}

fn read_u16(buf: &[u8], off: usize, big_endian: bool) -> u16 {
    let bytes = [buf[off], buf[off + 1]];
    if big_endian {
        u16::from_be_bytes(bytes)
    } else {
        u16::from_le_bytes(bytes)
    }
}

fn write_u16(buf: &mut [u8], off: usize, value: u16, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    buf[off..off + 2].copy_from_slice(&bytes);
}

//! Realtime input blocks
//!
//! Ingest delivers either compressed data records or already decoded sample
//! arrays. Both are decoded to `i32` once and then take the same merge path.

use crate::storage::codec::SampleCodec;
use crate::storage::error::{CodecError, StorageError, StorageResult};
use crate::storage::mseed::RecordHeader;
use crate::storage::types::SeedName;

#[derive(Debug, Clone, PartialEq)]
pub enum TimeSeriesBlock {
    Compressed {
        channel: SeedName,
        start_micros: i64,
        rate: f64,
        nsamp: usize,
        encoding: u8,
        big_endian: bool,
        payload: Vec<u8>,
    },
    Raw {
        channel: SeedName,
        start_micros: i64,
        rate: f64,
        samples: Vec<i32>,
    },
}

impl TimeSeriesBlock {
    /// Wrap a complete data record
    pub fn from_record(buf: &[u8]) -> StorageResult<Self> {
        let header = RecordHeader::parse(buf)?;
        let end = header.record_length.min(buf.len());
        if header.data_offset == 0 || header.data_offset > end {
            return Err(StorageError::InvalidRecord(format!(
                "data offset {} outside record of {} bytes for {}",
                header.data_offset, end, header.seed_name
            )));
        }
        Ok(Self::Compressed {
            channel: header.seed_name,
            start_micros: header.start_micros,
            rate: header.rate,
            nsamp: header.nsamp,
            encoding: header.encoding,
            big_endian: header.data_big_endian,
            payload: buf[header.data_offset..end].to_vec(),
        })
    }

    pub fn raw(channel: SeedName, start_micros: i64, rate: f64, samples: Vec<i32>) -> Self {
        Self::Raw {
            channel,
            start_micros,
            rate,
            samples,
        }
    }

    pub fn channel(&self) -> &SeedName {
        match self {
            Self::Compressed { channel, .. } | Self::Raw { channel, .. } => channel,
        }
    }

    pub fn start_micros(&self) -> i64 {
        match self {
            Self::Compressed { start_micros, .. } | Self::Raw { start_micros, .. } => *start_micros,
        }
    }

    pub fn start_millis(&self) -> i64 {
        self.start_micros().div_euclid(1000)
    }

    pub fn rate(&self) -> f64 {
        match self {
            Self::Compressed { rate, .. } | Self::Raw { rate, .. } => *rate,
        }
    }

    pub fn nsamp(&self) -> usize {
        match self {
            Self::Compressed { nsamp, .. } => *nsamp,
            Self::Raw { samples, .. } => samples.len(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed { .. })
    }

    /// Time just after the last sample, epoch ms
    pub fn end_millis(&self) -> i64 {
        let rate = self.rate();
        if rate <= 0.0 {
            return self.start_millis();
        }
        let micros = self.start_micros() + (self.nsamp() as f64 / rate * 1_000_000.0).round() as i64;
        micros.div_euclid(1000)
    }

    /// Decode into `out`, replacing its contents
    pub fn decode(&self, codec: &dyn SampleCodec, out: &mut Vec<i32>) -> Result<(), CodecError> {
        out.clear();
        match self {
            Self::Raw { samples, .. } => {
                out.extend_from_slice(samples);
                Ok(())
            }
            Self::Compressed {
                nsamp,
                encoding,
                big_endian,
                payload,
                ..
            } => codec.decode(*encoding, *big_endian, payload, *nsamp, out),
        }
    }
}

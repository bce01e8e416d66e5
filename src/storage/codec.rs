//! Sample codec seam
//!
//! Compressed payload formats (Steim1/Steim2) are provided by an external
//! codec library. The store only needs "decode payload to `i32`" and, for
//! delete trims, "encode `i32` back into a payload", so both sit behind
//! [`SampleCodec`]. [`PlainCodec`] handles the uncompressed integer
//! encodings and reports everything else as unsupported.

use crate::storage::error::CodecError;

/// SEED data encoding identifiers (blockette 1000, byte 4)
pub mod encoding {
    pub const INT16: u8 = 1;
    pub const INT32: u8 = 3;
    pub const FLOAT32: u8 = 4;
    pub const FLOAT64: u8 = 5;
    pub const STEIM1: u8 = 10;
    pub const STEIM2: u8 = 11;

    /// Human readable name for logs
    pub fn name(encoding: u8) -> &'static str {
        match encoding {
            INT16 => "INT16",
            INT32 => "INT32",
            FLOAT32 => "FLOAT32",
            FLOAT64 => "FLOAT64",
            STEIM1 => "STEIM1",
            STEIM2 => "STEIM2",
            _ => "UNKNOWN",
        }
    }
}

/// Decoder/encoder for record payloads
pub trait SampleCodec: Send + Sync {
    /// Decode `nsamp` samples from `payload`, appending to `out`
    fn decode(
        &self,
        encoding: u8,
        big_endian: bool,
        payload: &[u8],
        nsamp: usize,
        out: &mut Vec<i32>,
    ) -> Result<(), CodecError>;

    /// Encode `samples` into `out`, returning the number of bytes written
    fn encode(
        &self,
        encoding: u8,
        big_endian: bool,
        samples: &[i32],
        out: &mut [u8],
    ) -> Result<usize, CodecError>;
}

/// Codec for the uncompressed integer encodings
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl SampleCodec for PlainCodec {
    fn decode(
        &self,
        encoding: u8,
        big_endian: bool,
        payload: &[u8],
        nsamp: usize,
        out: &mut Vec<i32>,
    ) -> Result<(), CodecError> {
        let width = match encoding {
            encoding::INT16 => 2,
            encoding::INT32 => 4,
            other => return Err(CodecError::Unsupported(other)),
        };
        let needed = nsamp * width;
        if payload.len() < needed {
            return Err(CodecError::ShortPayload {
                needed,
                available: payload.len(),
            });
        }

        out.reserve(nsamp);
        for chunk in payload[..needed].chunks_exact(width) {
            let value = match (width, big_endian) {
                (2, true) => i16::from_be_bytes([chunk[0], chunk[1]]) as i32,
                (2, false) => i16::from_le_bytes([chunk[0], chunk[1]]) as i32,
                (_, true) => i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                (_, false) => i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            };
            out.push(value);
        }
        Ok(())
    }

    fn encode(
        &self,
        encoding: u8,
        big_endian: bool,
        samples: &[i32],
        out: &mut [u8],
    ) -> Result<usize, CodecError> {
        let width = match encoding {
            encoding::INT16 => 2,
            encoding::INT32 => 4,
            other => return Err(CodecError::Unsupported(other)),
        };
        let needed = samples.len() * width;
        if out.len() < needed {
            return Err(CodecError::Overflow {
                samples: samples.len(),
                capacity: out.len(),
            });
        }

        for (sample, slot) in samples.iter().zip(out.chunks_exact_mut(width)) {
            if width == 2 {
                let v = *sample as i16;
                slot.copy_from_slice(&if big_endian { v.to_be_bytes() } else { v.to_le_bytes() });
            } else if big_endian {
                slot.copy_from_slice(&sample.to_be_bytes());
            } else {
                slot.copy_from_slice(&sample.to_le_bytes());
            }
        }
        Ok(needed)
    }
}

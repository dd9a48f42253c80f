//! Compressed block frames.
//!
//! Every compressed block is sent as a single frame:
//!
//! ```text
//! | checksum (8) | method (1) | compressed size (4) | decompressed size (4) | payload |
//! ```
//!
//! The checksum is an xxh64 of everything after it. Compressed size includes
//! the 9 byte header but not the checksum.

use bytes::BufMut;
use twox_hash::XxHash64;

use crate::codec::wire::{DecodeError, DecodeResult, WireReader};
use crate::errors::NativeSrvError;

pub const CHECKSUM_SIZE: usize = 8;
pub const HEADER_SIZE: usize = 9;
/// Frames larger than this are rejected before allocating.
pub const MAX_FRAME_SIZE: usize = 1 << 30;

const CHECKSUM_SEED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    #[default]
    Lz4,
    /// Framed but stored as is.
    None,
}

impl CompressionMethod {
    pub fn byte(&self) -> u8 {
        match self {
            Self::Lz4 => 0x82,
            Self::None => 0x02,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, NativeSrvError> {
        match b {
            0x82 => Ok(Self::Lz4),
            0x02 => Ok(Self::None),
            other => Err(NativeSrvError::UnknownCompressionMethod(other)),
        }
    }

    /// Parse the value of the `network_compression_method` setting.
    pub fn from_setting(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lz4" => Some(Self::Lz4),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn setting_name(&self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::None => "none",
        }
    }
}

/// Compress `data` into a single frame appended to `dst`.
pub fn write_frame(method: CompressionMethod, data: &[u8], dst: &mut impl BufMut) {
    let payload = match method {
        CompressionMethod::Lz4 => lz4_flex::block::compress(data),
        CompressionMethod::None => data.to_vec(),
    };

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u8(method.byte());
    frame.put_u32_le((HEADER_SIZE + payload.len()) as u32);
    frame.put_u32_le(data.len() as u32);
    frame.extend_from_slice(&payload);

    dst.put_u64_le(XxHash64::oneshot(CHECKSUM_SEED, &frame));
    dst.put_slice(&frame);
}

/// Read a single frame, returning the decompressed bytes.
pub fn read_frame(r: &mut WireReader<'_>) -> DecodeResult<Vec<u8>> {
    let expected = r.read_u64_le()?;
    let header = r.read_bytes(HEADER_SIZE)?;

    let method = CompressionMethod::from_byte(header[0])?;
    let compressed_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let decompressed_size = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

    if compressed_size < HEADER_SIZE || compressed_size > MAX_FRAME_SIZE {
        return Err(NativeSrvError::malformed(format!(
            "invalid compressed frame size {compressed_size}"
        ))
        .into());
    }
    if decompressed_size > MAX_FRAME_SIZE {
        return Err(NativeSrvError::malformed(format!(
            "invalid decompressed frame size {decompressed_size}"
        ))
        .into());
    }

    let payload = r.read_bytes(compressed_size - HEADER_SIZE)?;

    let mut hasher_input = Vec::with_capacity(compressed_size);
    hasher_input.extend_from_slice(header);
    hasher_input.extend_from_slice(payload);
    let actual = XxHash64::oneshot(CHECKSUM_SEED, &hasher_input);
    if actual != expected {
        return Err(DecodeError::Invalid(NativeSrvError::ChecksumMismatch {
            expected,
            actual,
        }));
    }

    match method {
        CompressionMethod::Lz4 => lz4_flex::block::decompress(payload, decompressed_size)
            .map_err(|e| NativeSrvError::malformed(format!("lz4 decompression failed: {e}")).into()),
        CompressionMethod::None => {
            if payload.len() != decompressed_size {
                return Err(NativeSrvError::malformed("uncompressed frame size mismatch").into());
            }
            Ok(payload.to_vec())
        }
    }
}

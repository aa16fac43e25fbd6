// OP_COMPRESSED payload handling (snappy and zlib).

use crate::error::DecompressError;
use flate2::read::ZlibDecoder;
use serde::Serialize;
use std::io::Read;

/// Ceiling on any decompressed buffer.
pub const MAX_UNCOMPRESSED_SIZE: usize = 20 * 1024 * 1024;

pub const COMPRESSOR_NOOP: u8 = 0;
pub const COMPRESSOR_SNAPPY: u8 = 1;
pub const COMPRESSOR_ZLIB: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compressor {
    Noop,
    Snappy,
    Zlib,
    Other(u8),
}

impl From<u8> for Compressor {
    fn from(id: u8) -> Self {
        match id {
            COMPRESSOR_NOOP => Compressor::Noop,
            COMPRESSOR_SNAPPY => Compressor::Snappy,
            COMPRESSOR_ZLIB => Compressor::Zlib,
            other => Compressor::Other(other),
        }
    }
}

impl Compressor {
    pub fn id(self) -> u8 {
        match self {
            Compressor::Noop => COMPRESSOR_NOOP,
            Compressor::Snappy => COMPRESSOR_SNAPPY,
            Compressor::Zlib => COMPRESSOR_ZLIB,
            Compressor::Other(id) => id,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Snappy => "snappy",
            Compressor::Zlib => "zlib",
            Compressor::Other(_) => "unknown",
        }
    }
}

/// Decompress `payload` into a fresh buffer of at most [`MAX_UNCOMPRESSED_SIZE`] bytes.
pub fn decompress(compressor: Compressor, payload: &[u8]) -> Result<Vec<u8>, DecompressError> {
    match compressor {
        Compressor::Noop => Ok(payload.to_vec()),
        Compressor::Snappy => decompress_snappy(payload),
        Compressor::Zlib => decompress_zlib(payload),
        Compressor::Other(id) => Err(DecompressError::UnsupportedCompressor(id)),
    }
}

fn corrupt(compressor: Compressor, reason: impl ToString) -> DecompressError {
    DecompressError::UnsupportedOrCorrupt {
        compressor: compressor.name(),
        reason: reason.to_string(),
    }
}

fn decompress_snappy(payload: &[u8]) -> Result<Vec<u8>, DecompressError> {
    // The size comes from the snappy preamble; check it before allocating.
    let size = snap::raw::decompress_len(payload).map_err(|e| corrupt(Compressor::Snappy, e))?;
    if size > MAX_UNCOMPRESSED_SIZE {
        return Err(DecompressError::TooLarge {
            size,
            limit: MAX_UNCOMPRESSED_SIZE,
        });
    }
    snap::raw::Decoder::new()
        .decompress_vec(payload)
        .map_err(|e| corrupt(Compressor::Snappy, e))
}

fn decompress_zlib(payload: &[u8]) -> Result<Vec<u8>, DecompressError> {
    // Reading one byte past the ceiling is enough to tell a bomb from a full buffer.
    let mut out = Vec::new();
    ZlibDecoder::new(payload)
        .take(MAX_UNCOMPRESSED_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| corrupt(Compressor::Zlib, e))?;
    if out.len() > MAX_UNCOMPRESSED_SIZE {
        return Err(DecompressError::TooLarge {
            size: out.len(),
            limit: MAX_UNCOMPRESSED_SIZE,
        });
    }
    Ok(out)
}

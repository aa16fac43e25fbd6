use serde::Serialize;
use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;

/// Failure of a bounds-checked read or of a body decoder.
///
/// These never escape a single message: the dispatcher turns them into
/// anomalies and keeps whatever was decoded before the failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeError {
    #[error("truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("negative length {length} at offset {offset}")]
    NegativeLength { offset: usize, length: i32 },

    #[error("full collection name {name:?} has no '.' separator")]
    MalformedCollectionName { offset: usize, name: String },

    #[error("section size {size} too small at offset {offset}")]
    BadSectionSize { offset: usize, size: i32 },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::Truncated { offset, .. }
            | DecodeError::UnterminatedString { offset }
            | DecodeError::NegativeLength { offset, .. }
            | DecodeError::MalformedCollectionName { offset, .. }
            | DecodeError::BadSectionSize { offset, .. } => *offset,
        }
    }
}

/// Why an `OP_COMPRESSED` payload could not be turned into an inner message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompressError {
    #[error("uncompressed size {size} exceeds the {limit} byte ceiling")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported or corrupt {compressor} data: {reason}")]
    UnsupportedOrCorrupt {
        compressor: &'static str,
        reason: String,
    },

    #[error("unsupported compression format: {0}")]
    UnsupportedCompressor(u8),
}

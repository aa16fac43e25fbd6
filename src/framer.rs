//! TCP stream framing: cut a growing byte stream into length-prefixed messages.

use crate::protocol::{HEADER_LEN, Message, decode_message};
use crate::sink::{Anomaly, AnomalyKind, DataSource, Severity, Sink};
use bytes::{Buf, Bytes, BytesMut};

/// MongoDB's default `maxMessageSizeBytes`.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// One complete message, still undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream offset of the first length byte.
    pub offset: u64,
    pub bytes: Bytes,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("message length {length} at stream offset {offset} is outside 16..={max}; discarded {discarded} bytes")]
    BadLength {
        offset: u64,
        length: i32,
        max: usize,
        discarded: usize,
    },
}

impl FrameError {
    pub fn offset(&self) -> u64 {
        match self {
            FrameError::BadLength { offset, .. } => *offset,
        }
    }
}

/// Accumulates stream bytes and yields complete frames.
///
/// The declared length only decides when a frame is complete; it never sizes
/// a buffer.
#[derive(Debug)]
pub struct StreamFramer {
    buf: BytesMut,
    offset: u64,
    max_message_size: usize,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl StreamFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            offset: 0,
            max_message_size,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet handed out as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Stream offset of the next unconsumed byte.
    pub fn stream_offset(&self) -> u64 {
        self.offset
    }

    /// `Ok(None)` means more bytes are needed. After an `Err` the buffer is
    /// empty and framing resumes with the next [`push`](Self::push).
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let length = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let valid = usize::try_from(length)
            .ok()
            .filter(|&len| (HEADER_LEN..=self.max_message_size).contains(&len));
        let Some(len) = valid else {
            let offset = self.offset;
            let discarded = self.buf.len();
            self.buf.advance(discarded);
            self.offset += discarded as u64;
            return Err(FrameError::BadLength {
                offset,
                length,
                max: self.max_message_size,
                discarded,
            });
        };
        if self.buf.len() < len {
            return Ok(None);
        }

        let frame = Frame {
            offset: self.offset,
            bytes: self.buf.split_to(len).freeze(),
        };
        self.offset += len as u64;
        Ok(Some(frame))
    }
}

/// A framer plus the message decoder: bytes in, [`Message`]s out.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    framer: StreamFramer,
}

impl StreamDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            framer: StreamFramer::new(max_message_size),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.framer.push(data);
    }

    pub fn framer(&self) -> &StreamFramer {
        &self.framer
    }

    /// Decode every complete message buffered so far. Framing errors are
    /// reported to `sink` as anomalies and never stop the drain.
    pub fn drain(&mut self, sink: &mut dyn Sink) -> Vec<Message> {
        let mut out = Vec::new();
        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => match decode_message(&frame.bytes, frame.offset, sink) {
                    Ok(msg) => out.push(msg),
                    Err(e) => {
                        tracing::debug!(offset = frame.offset, error = %e, "undecodable frame");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "framing error");
                    sink.anomaly(&Anomaly {
                        severity: Severity::Error,
                        kind: AnomalyKind::BadLength,
                        message: err.to_string(),
                        source: DataSource::Wire,
                        offset: err.offset(),
                    });
                }
            }
        }
        out
    }
}

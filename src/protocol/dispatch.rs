use super::compression::{Compressor, decompress};
use super::context::DecodeContext;
use super::cursor::ByteCursor;
use super::ops::{self, Compressed, CompressedInner, CompressionEnvelope, OperationBody, Unknown};
use super::*;
use crate::error::{DecodeError, DecompressError};
use crate::sink::{Anomaly, AnomalyKind, FieldValue, Severity, Sink, field};
use serde::Serialize;

/// Deepest chain of `OP_COMPRESSED` envelopes that is unwrapped.
pub const MAX_COMPRESSION_NESTING: u32 = 8;

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Stream offset of the first header byte.
    pub offset: u64,
    pub header: MessageHeader,
    /// The opcode callers should see: the wrapped opcode for compressed messages.
    pub effective_opcode: i32,
    /// `None` when the body could not be decoded at all.
    pub body: Option<OperationBody>,
    pub anomalies: Vec<Anomaly>,
}

impl Message {
    pub fn is_compressed(&self) -> bool {
        self.header.op_code == OP_COMPRESSED
    }

    /// `Request : Query`, `Response : Reply (Compressed)` and so on.
    pub fn summary(&self) -> String {
        let direction = if self.effective_opcode == OP_REPLY {
            "Response"
        } else {
            "Request"
        };
        let mut line = format!("{direction} : {}", opcode_name(self.effective_opcode));
        if self.is_compressed() {
            line.push_str(" (Compressed)");
        }
        line
    }

    pub fn worst_severity(&self) -> Option<Severity> {
        self.anomalies.iter().map(|a| a.severity).max()
    }
}

pub fn opcode_name(opcode: i32) -> &'static str {
    match opcode {
        OP_REPLY => "Reply",
        OP_MESSAGE => "Message",
        OP_UPDATE => "Update document",
        OP_INSERT => "Insert document",
        OP_RESERVED => "Reserved",
        OP_QUERY => "Query",
        OP_GET_MORE => "Get More",
        OP_DELETE => "Delete document",
        OP_KILL_CURSORS => "Kill Cursors",
        OP_COMMAND => "Command Request",
        OP_COMMAND_REPLY => "Command Reply",
        OP_COMPRESSED => "Compressed Data",
        OP_MSG => "Extensible Message Format",
        _ => "Unknown",
    }
}

/// Decode one complete frame. `stream_offset` is where the frame starts in
/// the captured stream.
///
/// Only a frame too short for the 16-byte header is an `Err`; every other
/// problem ends up in [`Message::anomalies`] (and in `sink`).
pub fn decode_message(frame: &[u8], stream_offset: u64, sink: &mut dyn Sink) -> Result<Message, DecodeError> {
    let mut ctx = DecodeContext::new(sink, stream_offset);
    let mut cur = ByteCursor::new(frame);

    let header = match MessageHeader::read(&mut cur, &mut ctx) {
        Ok(h) => h,
        Err(err) => {
            ctx.decode_error(&err);
            return Err(err);
        }
    };
    if usize::try_from(header.message_length).ok() != Some(frame.len()) {
        ctx.anomaly(
            Severity::Warn,
            AnomalyKind::SizeMismatch,
            0,
            format!(
                "header declares {} bytes but the frame holds {}",
                header.message_length,
                frame.len()
            ),
        );
    }

    let body = match dispatch(header.op_code, &mut cur, &mut ctx, 0) {
        Ok(body) => {
            check_trailing(&mut cur, &mut ctx);
            Some(body)
        }
        Err(err) => {
            ctx.decode_error(&err);
            None
        }
    };
    let effective_opcode = body
        .as_ref()
        .map_or(header.op_code, |b| b.effective_opcode(header.op_code));

    tracing::trace!(
        offset = stream_offset,
        op_code = header.op_code,
        effective_opcode,
        request_id = header.request_id,
        "decoded message"
    );

    Ok(Message {
        offset: stream_offset,
        header,
        effective_opcode,
        body,
        anomalies: ctx.into_anomalies(),
    })
}

/// Route `opcode` to its body decoder. `nesting` counts the compression
/// envelopes already unwrapped.
pub(crate) fn dispatch(
    opcode: i32,
    cur: &mut ByteCursor<'_>,
    ctx: &mut DecodeContext<'_>,
    nesting: u32,
) -> Result<OperationBody, DecodeError> {
    let body = match opcode {
        OP_REPLY => OperationBody::Reply(ops::decode_reply(cur, ctx)?),
        OP_MESSAGE => OperationBody::Message(ops::decode_legacy_message(cur, ctx)?),
        OP_UPDATE => OperationBody::Update(ops::decode_update(cur, ctx)?),
        OP_INSERT => OperationBody::Insert(ops::decode_insert(cur, ctx)?),
        OP_QUERY => OperationBody::Query(ops::decode_query(cur, ctx)?),
        OP_GET_MORE => OperationBody::GetMore(ops::decode_get_more(cur, ctx)?),
        OP_DELETE => OperationBody::Delete(ops::decode_delete(cur, ctx)?),
        OP_KILL_CURSORS => OperationBody::KillCursors(ops::decode_kill_cursors(cur, ctx)?),
        OP_COMMAND => OperationBody::Command(ops::decode_command(cur, ctx)?),
        OP_COMMAND_REPLY => OperationBody::CommandReply(ops::decode_command_reply(cur, ctx)?),
        OP_COMPRESSED => OperationBody::Compressed(decode_compressed(cur, ctx, nesting)?),
        OP_MSG => OperationBody::Msg(ops::decode_msg(cur, ctx)?),
        other => {
            let offset = cur.position();
            let bytes = cur.rest();
            ctx.field(field::UNKNOWN, offset, bytes.len(), FieldValue::Bytes(bytes.to_vec()));
            ctx.anomaly(
                Severity::Warn,
                AnomalyKind::UnknownOpcode,
                offset,
                format!("unknown opcode {other}"),
            );
            OperationBody::Unknown(Unknown {
                opcode: other,
                bytes: bytes.to_vec(),
            })
        }
    };
    Ok(body)
}

fn check_trailing(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) {
    if cur.is_empty() {
        return;
    }
    let offset = cur.position();
    let rest = cur.rest();
    ctx.field(field::UNKNOWN, offset, rest.len(), FieldValue::Bytes(rest.to_vec()));
    ctx.anomaly(
        Severity::Warn,
        AnomalyKind::TrailingBytes,
        offset,
        format!("{} unconsumed bytes after the body", rest.len()),
    );
}

fn decode_compressed(
    cur: &mut ByteCursor<'_>,
    ctx: &mut DecodeContext<'_>,
    nesting: u32,
) -> Result<Compressed, DecodeError> {
    let start = cur.position();
    ctx.field(field::COMPRESSION_INFO, start, 9usize.min(cur.remaining()), FieldValue::None);
    let original_opcode = ops::read_i32(cur, ctx, field::ORIGINAL_OPCODE)?;
    let uncompressed_size = ops::read_i32(cur, ctx, field::UNCOMPRESSED_SIZE)?;
    let compressor_offset = cur.position();
    let compressor = Compressor::from(cur.read_u8()?);
    ctx.field(field::COMPRESSOR, compressor_offset, 1, FieldValue::U8(compressor.id()));

    // Noop payloads are decoded in place, so keep a cursor at the payload.
    let mut in_place = cur.clone();
    let payload_offset = cur.position();
    let payload = cur.rest();
    ctx.field(field::COMPRESSED_DATA, payload_offset, payload.len(), FieldValue::None);

    let envelope = CompressionEnvelope {
        original_opcode,
        uncompressed_size,
        compressor,
        payload: payload.to_vec(),
    };

    if nesting >= MAX_COMPRESSION_NESTING {
        ctx.anomaly(
            Severity::Error,
            AnomalyKind::CompressionNesting,
            start,
            format!("more than {MAX_COMPRESSION_NESTING} nested compression envelopes"),
        );
        return Ok(Compressed {
            envelope,
            inner: CompressedInner::NestingExceeded,
        });
    }

    if compressor == Compressor::Noop {
        check_declared_size(uncompressed_size, payload.len(), start + 4, ctx);
        let inner = match dispatch(original_opcode, &mut in_place, ctx, nesting + 1) {
            Ok(body) => {
                check_trailing(&mut in_place, ctx);
                CompressedInner::Decoded(Box::new(body))
            }
            Err(err) => {
                ctx.decode_error(&err);
                CompressedInner::Malformed(err)
            }
        };
        return Ok(Compressed { envelope, inner });
    }

    let inner = match decompress(compressor, payload) {
        Ok(buf) => {
            check_declared_size(uncompressed_size, buf.len(), start + 4, ctx);
            ctx.with_decompressed(|ctx| {
                let mut inner_cur = ByteCursor::new(&buf);
                match dispatch(original_opcode, &mut inner_cur, ctx, nesting + 1) {
                    Ok(body) => {
                        check_trailing(&mut inner_cur, ctx);
                        CompressedInner::Decoded(Box::new(body))
                    }
                    Err(err) => {
                        ctx.decode_error(&err);
                        CompressedInner::Malformed(err)
                    }
                }
            })
        }
        Err(err) => {
            let kind = match err {
                DecompressError::TooLarge { .. } => AnomalyKind::TooLargeCompressed,
                _ => AnomalyKind::UnsupportedCompression,
            };
            if matches!(compressor, Compressor::Zlib | Compressor::Other(_)) && kind == AnomalyKind::UnsupportedCompression
            {
                ctx.field(
                    field::UNSUPPORTED_COMPRESSED,
                    payload_offset,
                    payload.len(),
                    FieldValue::Bytes(payload.to_vec()),
                );
            }
            ctx.anomaly(Severity::Warn, kind, compressor_offset, err.to_string());
            CompressedInner::Failed(err)
        }
    };

    Ok(Compressed { envelope, inner })
}

fn check_declared_size(declared: i32, actual: usize, offset: usize, ctx: &mut DecodeContext<'_>) {
    if usize::try_from(declared).ok() != Some(actual) {
        ctx.anomaly(
            Severity::Warn,
            AnomalyKind::SizeMismatch,
            offset,
            format!("uncompressedSize is {declared} but the payload decompressed to {actual} bytes"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compression::MAX_UNCOMPRESSED_SIZE;
    use crate::sink::{DataSource, RecordingSink};
    use bson::doc;

    fn frame(op_code: i32, body: &[u8]) -> Vec<u8> {
        let mut out = ((16 + body.len()) as i32).to_le_bytes().to_vec();
        out.extend_from_slice(&7u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&op_code.to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    fn envelope(original: i32, size: i32, compressor: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = original.to_le_bytes().to_vec();
        out.extend_from_slice(&size.to_le_bytes());
        out.push(compressor);
        out.extend_from_slice(payload);
        out
    }

    fn ping_msg_body() -> Vec<u8> {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend(bson::to_vec(&doc! {"ping": 1i32, "$db": "admin"}).unwrap());
        body
    }

    #[test]
    fn opcode_names() {
        assert_eq!(opcode_name(OP_MSG), "Extensible Message Format");
        assert_eq!(opcode_name(OP_RESERVED), "Reserved");
        assert_eq!(opcode_name(42), "Unknown");
    }

    #[test]
    fn short_frame_is_an_error() {
        let mut sink = RecordingSink::new();
        assert!(decode_message(&[1, 2, 3], 0, &mut sink).is_err());
        assert!(sink.has_anomaly(AnomalyKind::Truncated));
    }

    #[test]
    fn plain_msg_decodes_cleanly() {
        let bytes = frame(OP_MSG, &ping_msg_body());
        let mut sink = RecordingSink::new();
        let msg = decode_message(&bytes, 100, &mut sink).unwrap();
        assert!(msg.anomalies.is_empty(), "{:?}", msg.anomalies);
        assert_eq!(msg.summary(), "Request : Extensible Message Format");
        assert_eq!(sink.first(field::OPCODE).unwrap().offset, 112);
        let Some(OperationBody::Msg(m)) = &msg.body else {
            panic!("expected OP_MSG");
        };
        assert_eq!(m.body().and_then(|d| d.first_key()), Some("ping"));
    }

    #[test]
    fn unknown_and_reserved_opcodes_surface_bytes() {
        for op in [OP_RESERVED, 9999] {
            let bytes = frame(op, &[1, 2, 3]);
            let mut sink = RecordingSink::new();
            let msg = decode_message(&bytes, 0, &mut sink).unwrap();
            assert_eq!(msg.worst_severity(), Some(Severity::Warn));
            assert!(sink.has_anomaly(AnomalyKind::UnknownOpcode));
            assert_eq!(sink.first(field::UNKNOWN).unwrap().value, FieldValue::Bytes(vec![1, 2, 3]));
        }
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend(b"a.b\0");
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&5i64.to_le_bytes());
        body.extend_from_slice(&[0xff, 0xfe]);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_GET_MORE, &body), 0, &mut sink).unwrap();
        assert!(matches!(msg.body, Some(OperationBody::GetMore(_))));
        assert!(sink.has_anomaly(AnomalyKind::TrailingBytes));
    }

    #[test]
    fn header_length_mismatch_is_a_warning() {
        let mut bytes = frame(OP_MSG, &ping_msg_body());
        bytes[0] = bytes[0].wrapping_add(1);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&bytes, 0, &mut sink).unwrap();
        assert!(msg.body.is_some());
        assert!(sink.has_anomaly(AnomalyKind::SizeMismatch));
    }

    #[test]
    fn noop_compression_decodes_in_place() {
        let inner = ping_msg_body();
        let body = envelope(OP_MSG, inner.len() as i32, 0, &inner);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(msg.anomalies.is_empty(), "{:?}", msg.anomalies);
        assert_eq!(msg.effective_opcode, OP_MSG);
        assert_eq!(msg.summary(), "Request : Extensible Message Format (Compressed)");
        assert!(sink.fields.iter().all(|r| r.source == DataSource::Wire));
    }

    #[test]
    fn snappy_payload_is_decoded_with_decompressed_offsets() {
        let inner = ping_msg_body();
        let packed = snap::raw::Encoder::new().compress_vec(&inner).unwrap();
        let body = envelope(OP_MSG, inner.len() as i32, 1, &packed);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(msg.anomalies.is_empty(), "{:?}", msg.anomalies);
        let flags = sink.first(field::MSG_FLAGS).unwrap();
        assert_eq!((flags.source, flags.offset), (DataSource::Decompressed, 0));
        let Some(OperationBody::Compressed(c)) = &msg.body else {
            panic!("expected OP_COMPRESSED");
        };
        assert!(matches!(c.decoded(), Some(OperationBody::Msg(_))));
    }

    #[test]
    fn declared_size_mismatch_is_a_warning() {
        let inner = ping_msg_body();
        let packed = snap::raw::Encoder::new().compress_vec(&inner).unwrap();
        let body = envelope(OP_MSG, 3, 1, &packed);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(sink.has_anomaly(AnomalyKind::SizeMismatch));
        assert!(msg.body.is_some());
    }

    #[test]
    fn oversized_snappy_payload_is_skipped() {
        let mut preamble = Vec::new();
        let mut n = (MAX_UNCOMPRESSED_SIZE + 1) as u64;
        while n >= 0x80 {
            preamble.push((n as u8) | 0x80);
            n >>= 7;
        }
        preamble.push(n as u8);
        let body = envelope(OP_QUERY, 0, 1, &preamble);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(sink.has_anomaly(AnomalyKind::TooLargeCompressed));
        assert!(sink.first(field::UNSUPPORTED_COMPRESSED).is_none());
        assert_eq!(msg.effective_opcode, OP_QUERY);
    }

    #[test]
    fn unknown_compressor_surfaces_raw_payload() {
        let body = envelope(OP_QUERY, 4, 9, &[1, 2, 3, 4]);
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(sink.has_anomaly(AnomalyKind::UnsupportedCompression));
        assert_eq!(
            sink.first(field::UNSUPPORTED_COMPRESSED).unwrap().value,
            FieldValue::Bytes(vec![1, 2, 3, 4])
        );
        let Some(OperationBody::Compressed(c)) = &msg.body else {
            panic!("expected OP_COMPRESSED");
        };
        assert_eq!(c.inner, CompressedInner::Failed(DecompressError::UnsupportedCompressor(9)));
    }

    #[test]
    fn nested_envelopes_stop_at_limit() {
        let mut body = ping_msg_body();
        let mut op = OP_MSG;
        for _ in 0..=MAX_COMPRESSION_NESTING {
            body = envelope(op, body.len() as i32, 0, &body);
            op = OP_COMPRESSED;
        }
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(sink.has_anomaly(AnomalyKind::CompressionNesting));
        assert_eq!(msg.worst_severity(), Some(Severity::Error));

        // One level fewer decodes all the way down.
        let mut body = ping_msg_body();
        let mut op = OP_MSG;
        for _ in 0..MAX_COMPRESSION_NESTING {
            body = envelope(op, body.len() as i32, 0, &body);
            op = OP_COMPRESSED;
        }
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut sink).unwrap();
        assert!(msg.anomalies.is_empty(), "{:?}", msg.anomalies);
        assert_eq!(msg.effective_opcode, OP_MSG);
    }

    #[test]
    fn body_failure_keeps_header() {
        let mut body = 0u32.to_le_bytes().to_vec();
        body.extend(b"nodot\0");
        body.extend(bson::to_vec(&doc! {}).unwrap());
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_INSERT, &body), 0, &mut sink).unwrap();
        assert!(msg.body.is_none());
        assert!(sink.has_anomaly(AnomalyKind::MalformedCollectionName));
        assert_eq!(msg.header.op_code, OP_INSERT);
    }

    #[test]
    fn reply_summary_is_a_response() {
        let mut body = vec![0u8; 20];
        body[16..20].copy_from_slice(&1i32.to_le_bytes());
        body.extend(bson::to_vec(&doc! {"ok": 1.0}).unwrap());
        let mut sink = RecordingSink::new();
        let msg = decode_message(&frame(OP_REPLY, &body), 0, &mut sink).unwrap();
        assert_eq!(msg.summary(), "Response : Reply");
        assert!(msg.anomalies.is_empty(), "{:?}", msg.anomalies);
    }

    #[test]
    fn compressed_reply_summary_follows_the_wrapped_opcode() {
        let mut reply = vec![0u8; 20];
        reply[16..20].copy_from_slice(&1i32.to_le_bytes());
        reply.extend(bson::to_vec(&doc! {"ok": 1.0}).unwrap());
        let body = envelope(OP_REPLY, reply.len() as i32, 0, &reply);
        let msg = decode_message(&frame(OP_COMPRESSED, &body), 0, &mut RecordingSink::new()).unwrap();
        assert_eq!(msg.summary(), "Response : Reply (Compressed)");
        assert!(msg.anomalies.is_empty(), "{:?}", msg.anomalies);
    }
}

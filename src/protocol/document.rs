//! Recursive BSON document decoding.
//!
//! The decoder trusts nothing but the buffer bounds: every read goes through
//! [`ByteCursor`], nesting is capped at [`MAX_NESTING`] and declared lengths
//! above [`MAX_DOCUMENT_SIZE`] are refused.

use super::context::DecodeContext;
use super::cursor::ByteCursor;
use crate::error::DecodeError;
use crate::sink::{AnomalyKind, FieldValue, Severity, field};
use bson::Bson;
use serde::Serialize;

/// Deepest document nesting decoded before giving up.
pub const MAX_NESTING: u32 = 100;
/// Largest accepted declared document length (MongoDB's 16 MB limit).
pub const MAX_DOCUMENT_SIZE: i32 = 16 * 1000 * 1000;
/// A document holding only its length and terminator.
pub const EMPTY_DOCUMENT_SIZE: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    Regex = 0x0B,
    DbPointer = 0x0C,
    JavaScriptCode = 0x0D,
    Symbol = 0x0E,
    JavaScriptCodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    Decimal128 = 0x13,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl ElementType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Double,
            0x02 => Self::String,
            0x03 => Self::Document,
            0x04 => Self::Array,
            0x05 => Self::Binary,
            0x06 => Self::Undefined,
            0x07 => Self::ObjectId,
            0x08 => Self::Boolean,
            0x09 => Self::DateTime,
            0x0A => Self::Null,
            0x0B => Self::Regex,
            0x0C => Self::DbPointer,
            0x0D => Self::JavaScriptCode,
            0x0E => Self::Symbol,
            0x0F => Self::JavaScriptCodeWithScope,
            0x10 => Self::Int32,
            0x11 => Self::Timestamp,
            0x12 => Self::Int64,
            0x13 => Self::Decimal128,
            0x7F => Self::MaxKey,
            0xFF => Self::MinKey,
            _ => return None,
        })
    }
}

/// 12-byte ObjectId split into its historical components. The timestamp and
/// counter are big-endian, the process id little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectId {
    pub timestamp: u32,
    pub machine_id: [u8; 3],
    pub pid: u16,
    pub increment: u32,
}

impl ObjectId {
    pub fn bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.timestamp.to_be_bytes());
        out[4..7].copy_from_slice(&self.machine_id);
        out[7..9].copy_from_slice(&self.pid.to_le_bytes());
        out[9..12].copy_from_slice(&self.increment.to_be_bytes()[1..]);
        out
    }

    fn read(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Self, DecodeError> {
        let start = cur.position();
        let raw = cur.sub_cursor(12).rest();
        let timestamp = cur.read_u32_be()?;
        let machine_id = cur.read_bytes(3)?;
        let pid = cur.read_u16_le()?;
        let increment = cur.read_u24_be()?;

        ctx.field(field::VALUE_OBJECTID, start, 12, FieldValue::Bytes(raw.to_vec()));
        ctx.field(field::VALUE_OBJECTID_TIME, start, 4, FieldValue::U32(timestamp));
        ctx.field(
            field::VALUE_OBJECTID_MACHINE_ID,
            start + 4,
            5,
            FieldValue::Bytes(raw[4..9].to_vec()),
        );
        let host = u32::from_le_bytes([machine_id[0], machine_id[1], machine_id[2], 0]);
        ctx.field(field::VALUE_OBJECTID_HOST, start + 4, 3, FieldValue::U32(host));
        ctx.field(field::VALUE_OBJECTID_PID, start + 7, 2, FieldValue::U32(pid.into()));
        ctx.field(field::VALUE_OBJECTID_INC, start + 9, 3, FieldValue::U32(increment));

        Ok(Self {
            timestamp,
            machine_id: [machine_id[0], machine_id[1], machine_id[2]],
            pid,
            increment,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BsonValue {
    Double(f64),
    String(String),
    Document(BsonDocument),
    Array(BsonDocument),
    Binary {
        subtype: u8,
        #[serde(serialize_with = "crate::sink::b64::serialize")]
        bytes: Vec<u8>,
    },
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    /// Milliseconds since the epoch, as stored.
    DateTime(i64),
    Null,
    Regex {
        pattern: String,
        options: String,
    },
    DbPointer {
        namespace: String,
        id: ObjectId,
    },
    JavaScriptCode(String),
    Symbol(String),
    JavaScriptCodeWithScope {
        code: String,
        scope: BsonDocument,
    },
    Int32(i32),
    /// Raw 64-bit value: increment in the low half, seconds in the high half.
    Timestamp(u64),
    Int64(i64),
    Decimal128(#[serde(serialize_with = "crate::sink::b64::serialize")] [u8; 16]),
    MinKey,
    MaxKey,
    /// Reserved or unrecognized type tag. The element walk stops here since
    /// the payload size is unknown.
    Unknown(u8),
}

impl BsonValue {
    pub fn element_type(&self) -> Option<ElementType> {
        Some(match self {
            Self::Double(_) => ElementType::Double,
            Self::String(_) => ElementType::String,
            Self::Document(_) => ElementType::Document,
            Self::Array(_) => ElementType::Array,
            Self::Binary { .. } => ElementType::Binary,
            Self::Undefined => ElementType::Undefined,
            Self::ObjectId(_) => ElementType::ObjectId,
            Self::Boolean(_) => ElementType::Boolean,
            Self::DateTime(_) => ElementType::DateTime,
            Self::Null => ElementType::Null,
            Self::Regex { .. } => ElementType::Regex,
            Self::DbPointer { .. } => ElementType::DbPointer,
            Self::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Self::Symbol(_) => ElementType::Symbol,
            Self::JavaScriptCodeWithScope { .. } => ElementType::JavaScriptCodeWithScope,
            Self::Int32(_) => ElementType::Int32,
            Self::Timestamp(_) => ElementType::Timestamp,
            Self::Int64(_) => ElementType::Int64,
            Self::Decimal128(_) => ElementType::Decimal128,
            Self::MinKey => ElementType::MinKey,
            Self::MaxKey => ElementType::MaxKey,
            Self::Unknown(_) => return None,
        })
    }

    /// Convert to the `bson` crate's value type. `None` for [`BsonValue::Unknown`].
    pub fn to_bson(&self) -> Option<Bson> {
        Some(match self {
            Self::Double(v) => Bson::Double(*v),
            Self::String(s) => Bson::String(s.clone()),
            Self::Document(d) => Bson::Document(d.to_bson()),
            Self::Array(d) => Bson::Array(d.elements.iter().filter_map(|e| e.value.to_bson()).collect()),
            Self::Binary { subtype, bytes } => Bson::Binary(bson::Binary {
                subtype: (*subtype).into(),
                bytes: bytes.clone(),
            }),
            Self::Undefined => Bson::Undefined,
            Self::ObjectId(oid) => Bson::ObjectId(bson::oid::ObjectId::from_bytes(oid.bytes())),
            Self::Boolean(b) => Bson::Boolean(*b),
            Self::DateTime(ms) => Bson::DateTime(bson::DateTime::from_millis(*ms)),
            Self::Null => Bson::Null,
            Self::Regex { pattern, options } => Bson::RegularExpression(bson::Regex {
                pattern: pattern.clone(),
                options: options.clone(),
            }),
            Self::DbPointer { namespace, id } => return db_pointer_to_bson(namespace, id),
            Self::JavaScriptCode(code) => Bson::JavaScriptCode(code.clone()),
            Self::Symbol(s) => Bson::Symbol(s.clone()),
            Self::JavaScriptCodeWithScope { code, scope } => {
                Bson::JavaScriptCodeWithScope(bson::JavaScriptCodeWithScope {
                    code: code.clone(),
                    scope: scope.to_bson(),
                })
            }
            Self::Int32(v) => Bson::Int32(*v),
            Self::Timestamp(raw) => Bson::Timestamp(bson::Timestamp {
                time: (*raw >> 32) as u32,
                increment: *raw as u32,
            }),
            Self::Int64(v) => Bson::Int64(*v),
            Self::Decimal128(bytes) => Bson::Decimal128(bson::Decimal128::from_bytes(*bytes)),
            Self::MinKey => Bson::MinKey,
            Self::MaxKey => Bson::MaxKey,
            Self::Unknown(_) => return None,
        })
    }
}

// bson keeps DbPointer's fields private, so build a one-element document and
// let the crate parse it.
fn db_pointer_to_bson(namespace: &str, id: &ObjectId) -> Option<Bson> {
    let ns = namespace.as_bytes();
    let total = 4 + 1 + 2 + 4 + ns.len() + 1 + 12 + 1;
    let mut raw = Vec::with_capacity(total);
    raw.extend_from_slice(&(total as i32).to_le_bytes());
    raw.push(ElementType::DbPointer as u8);
    raw.extend_from_slice(b"p\0");
    raw.extend_from_slice(&((ns.len() + 1) as i32).to_le_bytes());
    raw.extend_from_slice(ns);
    raw.push(0);
    raw.extend_from_slice(&id.bytes());
    raw.push(0);
    let mut doc = bson::Document::from_reader(&mut std::io::Cursor::new(raw)).ok()?;
    doc.remove("p")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BsonElement {
    pub name: String,
    pub tag: u8,
    pub value: BsonValue,
}

impl BsonElement {
    pub fn element_type(&self) -> Option<ElementType> {
        ElementType::from_tag(self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BsonDocument {
    pub declared_length: i32,
    pub elements: Vec<BsonElement>,
}

impl BsonDocument {
    pub fn new(declared_length: i32) -> Self {
        Self {
            declared_length,
            elements: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&BsonValue> {
        self.elements.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    /// Name of the first element; for command documents this is the command.
    pub fn first_key(&self) -> Option<&str> {
        self.elements.first().map(|e| e.name.as_str())
    }

    /// Convert to a `bson::Document`. Elements of unknown type are dropped.
    pub fn to_bson(&self) -> bson::Document {
        let mut doc = bson::Document::new();
        for el in &self.elements {
            if let Some(v) = el.value.to_bson() {
                doc.insert(el.name.clone(), v);
            }
        }
        doc
    }
}

/// Decode the document starting at `cur.position()` without moving `cur`.
///
/// `depth` is the nesting level of the caller (0 for a top-level document).
/// Returns the document and the number of bytes the caller should skip: the
/// declared length, or at least 4 when the document was refused. An error is
/// returned only when the length prefix itself cannot be read; problems
/// inside the document are reported to `ctx` and cut the element walk short.
pub fn decode_document(
    cur: &ByteCursor<'_>,
    depth: u32,
    label: &'static str,
    ctx: &mut DecodeContext<'_>,
) -> Result<(BsonDocument, usize), DecodeError> {
    let start = cur.position();
    let declared = cur.peek_i32_le()?;
    let available = cur.remaining();
    let span = usize::try_from(declared).unwrap_or(0).clamp(4, available);
    let mut doc = BsonDocument::new(declared);

    ctx.field(label, start, span, FieldValue::None);
    ctx.field(field::DOCUMENT_LENGTH, start, 4, FieldValue::I32(declared));

    let depth = depth + 1;
    if depth > MAX_NESTING {
        ctx.anomaly(
            Severity::Error,
            AnomalyKind::RecursionExceeded,
            start,
            format!("BSON document recursion exceeds {MAX_NESTING}"),
        );
        return Ok((doc, declared.max(4) as usize));
    }

    if declared < EMPTY_DOCUMENT_SIZE {
        ctx.anomaly(
            Severity::Error,
            AnomalyKind::BadLength,
            start,
            format!("BSON document length too short: {declared}"),
        );
        return Ok((doc, declared.max(4) as usize));
    }

    if declared > MAX_DOCUMENT_SIZE {
        ctx.anomaly(
            Severity::Error,
            AnomalyKind::BadLength,
            start,
            format!("BSON document length too long: {declared}"),
        );
        return Ok((doc, declared as usize));
    }

    let length = declared as usize;
    if length > available {
        ctx.anomaly(
            Severity::Error,
            AnomalyKind::Truncated,
            start,
            format!("BSON document length {declared} exceeds the {available} bytes available"),
        );
    }

    if declared == EMPTY_DOCUMENT_SIZE {
        ctx.field(field::DOCUMENT_EMPTY, start, span, FieldValue::None);
        return Ok((doc, length));
    }

    let mut body = cur.sub_cursor(length);
    body.advance(4)?;
    let terminator = start + length - 1;
    ctx.field(field::ELEMENTS, body.position(), span.saturating_sub(5), FieldValue::None);

    while body.position() < terminator {
        match decode_element(&mut body, depth, ctx) {
            Ok(el) => {
                let stop = matches!(el.value, BsonValue::Unknown(_));
                doc.elements.push(el);
                if stop {
                    break;
                }
            }
            Err(err) => {
                ctx.decode_error(&err);
                break;
            }
        }
    }

    Ok((doc, length))
}

fn decode_element(
    cur: &mut ByteCursor<'_>,
    depth: u32,
    ctx: &mut DecodeContext<'_>,
) -> Result<BsonElement, DecodeError> {
    let type_offset = cur.position();
    let tag = cur.read_u8()?;
    let name_offset = cur.position();
    let raw_name = cur.read_cstring()?;
    let name = lossy_utf8(raw_name, name_offset, ctx);
    ctx.field(field::ELEMENT_NAME, name_offset, raw_name.len(), FieldValue::Str(name.clone()));
    ctx.field(field::ELEMENT_TYPE, type_offset, 1, FieldValue::U8(tag));

    let Some(kind) = ElementType::from_tag(tag) else {
        ctx.anomaly(
            Severity::Warn,
            AnomalyKind::UnknownElementType,
            type_offset,
            format!("unknown BSON element type 0x{tag:02x} for {name:?}"),
        );
        return Ok(BsonElement {
            name,
            tag,
            value: BsonValue::Unknown(tag),
        });
    };

    let value = decode_value(kind, cur, depth, ctx)?;
    Ok(BsonElement { name, tag, value })
}

fn decode_value(
    kind: ElementType,
    cur: &mut ByteCursor<'_>,
    depth: u32,
    ctx: &mut DecodeContext<'_>,
) -> Result<BsonValue, DecodeError> {
    let offset = cur.position();
    let value = match kind {
        ElementType::Double => {
            let v = cur.read_f64_le()?;
            ctx.field(field::VALUE_DOUBLE, offset, 8, FieldValue::F64(v));
            BsonValue::Double(v)
        }
        ElementType::String => BsonValue::String(read_string(cur, ctx)?),
        ElementType::JavaScriptCode => BsonValue::JavaScriptCode(read_string(cur, ctx)?),
        ElementType::Symbol => BsonValue::Symbol(read_string(cur, ctx)?),
        ElementType::Document => BsonValue::Document(read_nested(cur, depth, field::DOCUMENT, ctx)?),
        ElementType::Array => BsonValue::Array(read_nested(cur, depth, field::DOCUMENT, ctx)?),
        ElementType::Binary => {
            let len = cur.read_i32_le()?;
            ctx.field(field::VALUE_BINARY_LENGTH, offset, 4, FieldValue::I32(len));
            if len < 0 {
                return Err(DecodeError::NegativeLength { offset, length: len });
            }
            let subtype = cur.read_u8()?;
            ctx.field(field::VALUE_BINARY_SUBTYPE, offset + 4, 1, FieldValue::U8(subtype));
            let bytes = cur.read_bytes(len as usize)?.to_vec();
            ctx.field(field::VALUE_BINARY, offset + 5, bytes.len(), FieldValue::Bytes(bytes.clone()));
            BsonValue::Binary { subtype, bytes }
        }
        ElementType::Undefined => BsonValue::Undefined,
        ElementType::Null => BsonValue::Null,
        ElementType::MinKey => BsonValue::MinKey,
        ElementType::MaxKey => BsonValue::MaxKey,
        ElementType::ObjectId => BsonValue::ObjectId(ObjectId::read(cur, ctx)?),
        ElementType::Boolean => {
            let b = cur.read_u8()? != 0;
            ctx.field(field::VALUE_BOOLEAN, offset, 1, FieldValue::Bool(b));
            BsonValue::Boolean(b)
        }
        ElementType::Regex => {
            let pattern_offset = cur.position();
            let raw = cur.read_cstring()?;
            let pattern = lossy_utf8(raw, pattern_offset, ctx);
            ctx.field(field::VALUE_REGEX_PATTERN, pattern_offset, raw.len() + 1, FieldValue::Str(pattern.clone()));
            let options_offset = cur.position();
            let raw = cur.read_cstring()?;
            let options = lossy_utf8(raw, options_offset, ctx);
            ctx.field(field::VALUE_REGEX_OPTIONS, options_offset, raw.len() + 1, FieldValue::Str(options.clone()));
            BsonValue::Regex { pattern, options }
        }
        ElementType::DbPointer => {
            let namespace = read_string(cur, ctx)?;
            let id_offset = cur.position();
            let id = ObjectId::read(cur, ctx)?;
            ctx.field(field::VALUE_DB_PTR, id_offset, 12, FieldValue::Bytes(id.bytes().to_vec()));
            BsonValue::DbPointer { namespace, id }
        }
        ElementType::JavaScriptCodeWithScope => {
            let total = cur.read_i32_le()?;
            ctx.field(field::ELEMENT_LENGTH, offset, 4, FieldValue::I32(total));
            let code_offset = cur.position();
            let code = read_string(cur, ctx)?;
            ctx.field(field::VALUE_JS_CODE, code_offset, cur.position() - code_offset, FieldValue::Str(code.clone()));
            let scope = read_nested(cur, depth, field::VALUE_JS_SCOPE, ctx)?;
            let actual = cur.position() - offset;
            if usize::try_from(total).ok() != Some(actual) {
                ctx.anomaly(
                    Severity::Warn,
                    AnomalyKind::SizeMismatch,
                    offset,
                    format!("code with scope declares {total} bytes but spans {actual}"),
                );
            }
            BsonValue::JavaScriptCodeWithScope { code, scope }
        }
        ElementType::Int32 => {
            let v = cur.read_i32_le()?;
            ctx.field(field::VALUE_INT32, offset, 4, FieldValue::I32(v));
            BsonValue::Int32(v)
        }
        ElementType::DateTime => {
            let v = cur.read_i64_le()?;
            ctx.field(field::VALUE_DATETIME, offset, 8, FieldValue::I64(v));
            BsonValue::DateTime(v)
        }
        ElementType::Timestamp => {
            let v = cur.read_u64_le()?;
            ctx.field(field::VALUE_TIMESTAMP, offset, 8, FieldValue::U64(v));
            BsonValue::Timestamp(v)
        }
        ElementType::Int64 => {
            let v = cur.read_i64_le()?;
            ctx.field(field::VALUE_INT64, offset, 8, FieldValue::I64(v));
            BsonValue::Int64(v)
        }
        ElementType::Decimal128 => {
            let raw = cur.read_bytes(16)?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(raw);
            ctx.field(field::VALUE_DECIMAL128, offset, 16, FieldValue::Bytes(raw.to_vec()));
            BsonValue::Decimal128(bytes)
        }
    };
    Ok(value)
}

/// Embedded document, array or scope: recurse and skip what it consumed.
fn read_nested(
    cur: &mut ByteCursor<'_>,
    depth: u32,
    label: &'static str,
    ctx: &mut DecodeContext<'_>,
) -> Result<BsonDocument, DecodeError> {
    let (doc, consumed) = decode_document(cur, depth, label, ctx)?;
    cur.advance_clamped(consumed);
    Ok(doc)
}

fn read_string(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<String, DecodeError> {
    let offset = cur.position();
    let (len, raw) = cur.read_length_prefixed()?;
    ctx.field(field::VALUE_STRING_LENGTH, offset, 4, FieldValue::I32(len));
    let text = raw.strip_suffix(&[0]).unwrap_or(raw);
    let s = lossy_utf8(text, offset + 4, ctx);
    ctx.field(field::VALUE_STRING, offset + 4, raw.len(), FieldValue::Str(s.clone()));
    Ok(s)
}

fn lossy_utf8(raw: &[u8], offset: usize, ctx: &mut DecodeContext<'_>) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_owned(),
        Err(e) => {
            ctx.anomaly(
                Severity::Warn,
                AnomalyKind::InvalidUtf8,
                offset + e.valid_up_to(),
                "invalid UTF-8 in BSON string",
            );
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

// Operation body decoders, one per opcode (OP_COMPRESSED lives in dispatch.rs
// because it re-enters the dispatcher).

use super::compression::Compressor;
use super::context::DecodeContext;
use super::cursor::ByteCursor;
use super::document::{BsonDocument, decode_document};
use crate::error::{DecodeError, DecompressError};
use crate::sink::{AnomalyKind, FieldValue, Severity, field};
use bitflags::{Flags, bitflags};
use serde::Serialize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct ReplyFlags: u32 {
        const CURSOR_NOT_FOUND = 0x0000_0001;
        const QUERY_FAILURE = 0x0000_0002;
        const SHARD_CONFIG_STALE = 0x0000_0004;
        const AWAIT_CAPABLE = 0x0000_0008;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct UpdateFlags: u32 {
        const UPSERT = 0x0000_0001;
        const MULTI_UPDATE = 0x0000_0002;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct InsertFlags: u32 {
        const CONTINUE_ON_ERROR = 0x0000_0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct QueryFlags: u32 {
        const TAILABLE_CURSOR = 0x0000_0002;
        const SLAVE_OK = 0x0000_0004;
        const OPLOG_REPLAY = 0x0000_0008;
        const NO_CURSOR_TIMEOUT = 0x0000_0010;
        const AWAIT_DATA = 0x0000_0020;
        const EXHAUST = 0x0000_0040;
        const PARTIAL = 0x0000_0080;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct DeleteFlags: u32 {
        const SINGLE_REMOVE = 0x0000_0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct MsgFlags: u32 {
        const CHECKSUM_PRESENT = 0x0000_0001;
        const MORE_TO_COME = 0x0000_0002;
        const EXHAUST_ALLOWED = 0x0001_0000;
    }
}

pub const SECTION_KIND_BODY: u8 = 0;
pub const SECTION_KIND_DOCUMENT_SEQUENCE: u8 = 1;

/// `database.collection`, split at the first dot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub full_name: String,
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<BsonDocument>,
}

/// Legacy `OP_MESSAGE` (1000): a single free-text string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyMessage {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    pub zero: i32,
    pub namespace: Namespace,
    pub flags: UpdateFlags,
    pub selector: BsonDocument,
    pub update: BsonDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insert {
    pub flags: InsertFlags,
    pub namespace: Namespace,
    pub documents: Vec<BsonDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    pub flags: QueryFlags,
    pub namespace: Namespace,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: BsonDocument,
    pub return_field_selectors: Vec<BsonDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GetMore {
    pub zero: i32,
    pub namespace: Namespace,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delete {
    pub zero: i32,
    pub namespace: Namespace,
    pub flags: DeleteFlags,
    pub selector: BsonDocument,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillCursors {
    pub zero: i32,
    pub number_of_cursor_ids: i32,
    pub cursor_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub database: String,
    pub command_name: String,
    pub metadata: BsonDocument,
    pub command_args: BsonDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReply {
    pub metadata: BsonDocument,
    pub command_reply: BsonDocument,
    pub output_docs: Option<BsonDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompressionEnvelope {
    pub original_opcode: i32,
    pub uncompressed_size: i32,
    pub compressor: Compressor,
    #[serde(serialize_with = "crate::sink::b64::serialize")]
    pub payload: Vec<u8>,
}

/// What became of the payload inside an `OP_COMPRESSED` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CompressedInner {
    Decoded(Box<OperationBody>),
    /// Decompressed fine but the inner body was cut short.
    Malformed(DecodeError),
    Failed(DecompressError),
    NestingExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compressed {
    pub envelope: CompressionEnvelope,
    pub inner: CompressedInner,
}

impl Compressed {
    /// Opcode of the innermost message, looking through nested envelopes.
    pub fn effective_opcode(&self) -> i32 {
        match &self.inner {
            CompressedInner::Decoded(body) => match body.as_ref() {
                OperationBody::Compressed(c) => c.effective_opcode(),
                _ => self.envelope.original_opcode,
            },
            _ => self.envelope.original_opcode,
        }
    }

    pub fn decoded(&self) -> Option<&OperationBody> {
        match &self.inner {
            CompressedInner::Decoded(body) => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "section", rename_all = "snake_case")]
pub enum MsgSection {
    Body {
        document: BsonDocument,
    },
    DocumentSequence {
        size: i32,
        identifier: String,
        documents: Vec<BsonDocument>,
    },
    Unknown {
        kind: u8,
        size: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Msg {
    pub flags: MsgFlags,
    pub sections: Vec<MsgSection>,
    pub checksum: Option<u32>,
}

impl Msg {
    /// The kind-0 body document, if any.
    pub fn body(&self) -> Option<&BsonDocument> {
        self.sections.iter().find_map(|s| match s {
            MsgSection::Body { document } => Some(document),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unknown {
    pub opcode: i32,
    #[serde(serialize_with = "crate::sink::b64::serialize")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationBody {
    Reply(Reply),
    Message(LegacyMessage),
    Update(Update),
    Insert(Insert),
    Query(Query),
    GetMore(GetMore),
    Delete(Delete),
    KillCursors(KillCursors),
    Command(Command),
    CommandReply(CommandReply),
    Compressed(Compressed),
    Msg(Msg),
    Unknown(Unknown),
}

impl OperationBody {
    /// Opcode a reader should see for this body, given the opcode on the wire.
    pub fn effective_opcode(&self, wire_opcode: i32) -> i32 {
        match self {
            OperationBody::Compressed(c) => c.effective_opcode(),
            _ => wire_opcode,
        }
    }
}

pub(super) fn read_i32(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>, name: &'static str) -> Result<i32, DecodeError> {
    let offset = cur.position();
    let v = cur.read_i32_le()?;
    ctx.field(name, offset, 4, FieldValue::I32(v));
    Ok(v)
}

pub(super) fn read_i64(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>, name: &'static str) -> Result<i64, DecodeError> {
    let offset = cur.position();
    let v = cur.read_i64_le()?;
    ctx.field(name, offset, 8, FieldValue::I64(v));
    Ok(v)
}

fn read_cstring(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>, name: &'static str) -> Result<String, DecodeError> {
    let offset = cur.position();
    let raw = cur.read_cstring()?;
    let s = String::from_utf8_lossy(raw).into_owned();
    ctx.field(name, offset, raw.len() + 1, FieldValue::Str(s.clone()));
    Ok(s)
}

/// Flag word plus one boolean record per known bit.
fn read_flags<F: Flags<Bits = u32>>(
    cur: &mut ByteCursor<'_>,
    ctx: &mut DecodeContext<'_>,
    name: &'static str,
) -> Result<F, DecodeError> {
    let offset = cur.position();
    let bits = cur.read_u32_le()?;
    let flags = F::from_bits_retain(bits);
    ctx.field(name, offset, 4, FieldValue::U32(bits));
    for (bit_name, bit) in F::all().iter_names() {
        ctx.field(
            format!("{name}.{}", bit_name.to_ascii_lowercase()),
            offset,
            4,
            FieldValue::Bool(flags.contains(bit)),
        );
    }
    Ok(flags)
}

/// Top-level document at the cursor; the cursor moves past it.
pub(crate) fn read_document(
    cur: &mut ByteCursor<'_>,
    ctx: &mut DecodeContext<'_>,
    label: &'static str,
) -> Result<BsonDocument, DecodeError> {
    let (doc, consumed) = decode_document(cur, 0, label, ctx)?;
    cur.advance_clamped(consumed);
    Ok(doc)
}

pub(crate) fn read_namespace(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Namespace, DecodeError> {
    let offset = cur.position();
    let raw = cur.read_cstring()?;
    let full_name = String::from_utf8_lossy(raw).into_owned();
    ctx.field(field::FULL_COLLECTION_NAME, offset, raw.len() + 1, FieldValue::Str(full_name.clone()));

    let Some(dot) = raw.iter().position(|&b| b == b'.') else {
        return Err(DecodeError::MalformedCollectionName { offset, name: full_name });
    };
    let database = String::from_utf8_lossy(&raw[..dot]).into_owned();
    let collection = String::from_utf8_lossy(&raw[dot + 1..]).into_owned();
    ctx.field(field::DATABASE_NAME, offset, dot, FieldValue::Str(database.clone()));
    ctx.field(field::COLLECTION_NAME, offset + dot + 1, raw.len() - dot - 1, FieldValue::Str(collection.clone()));

    Ok(Namespace {
        full_name,
        database,
        collection,
    })
}

pub fn decode_reply(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Reply, DecodeError> {
    let flags = read_flags(cur, ctx, field::REPLY_FLAGS)?;
    let cursor_id = read_i64(cur, ctx, field::CURSOR_ID)?;
    let starting_from = read_i32(cur, ctx, field::STARTING_FROM)?;
    let number_returned = read_i32(cur, ctx, field::NUMBER_RETURNED)?;

    // Each document consumes at least 4 bytes, so a forged count ends in a
    // truncation error rather than a long loop.
    let mut documents = Vec::new();
    for _ in 0..number_returned.max(0) {
        documents.push(read_document(cur, ctx, field::DOCUMENT)?);
    }

    Ok(Reply {
        flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}

pub fn decode_legacy_message(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<LegacyMessage, DecodeError> {
    let text = read_cstring(cur, ctx, field::MESSAGE)?;
    Ok(LegacyMessage { text })
}

pub fn decode_update(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Update, DecodeError> {
    let zero = read_i32(cur, ctx, field::ZERO)?;
    let namespace = read_namespace(cur, ctx)?;
    let flags = read_flags(cur, ctx, field::UPDATE_FLAGS)?;
    let selector = read_document(cur, ctx, field::SELECTOR)?;
    let update = read_document(cur, ctx, field::UPDATE)?;
    Ok(Update {
        zero,
        namespace,
        flags,
        selector,
        update,
    })
}

pub fn decode_insert(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Insert, DecodeError> {
    let flags = read_flags(cur, ctx, field::INSERT_FLAGS)?;
    let namespace = read_namespace(cur, ctx)?;
    let mut documents = Vec::new();
    while !cur.is_empty() {
        documents.push(read_document(cur, ctx, field::DOCUMENT)?);
    }
    Ok(Insert {
        flags,
        namespace,
        documents,
    })
}

pub fn decode_query(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Query, DecodeError> {
    let flags = read_flags(cur, ctx, field::QUERY_FLAGS)?;
    let namespace = read_namespace(cur, ctx)?;
    let number_to_skip = read_i32(cur, ctx, field::NUMBER_TO_SKIP)?;
    let number_to_return = read_i32(cur, ctx, field::NUMBER_TO_RETURN)?;
    let query = read_document(cur, ctx, field::QUERY)?;
    let mut return_field_selectors = Vec::new();
    while !cur.is_empty() {
        return_field_selectors.push(read_document(cur, ctx, field::RETURN_FIELD_SELECTOR)?);
    }
    Ok(Query {
        flags,
        namespace,
        number_to_skip,
        number_to_return,
        query,
        return_field_selectors,
    })
}

pub fn decode_get_more(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<GetMore, DecodeError> {
    let zero = read_i32(cur, ctx, field::ZERO)?;
    let namespace = read_namespace(cur, ctx)?;
    let number_to_return = read_i32(cur, ctx, field::NUMBER_TO_RETURN)?;
    let cursor_id = read_i64(cur, ctx, field::CURSOR_ID)?;
    Ok(GetMore {
        zero,
        namespace,
        number_to_return,
        cursor_id,
    })
}

pub fn decode_delete(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Delete, DecodeError> {
    let zero = read_i32(cur, ctx, field::ZERO)?;
    let namespace = read_namespace(cur, ctx)?;
    let flags = read_flags(cur, ctx, field::DELETE_FLAGS)?;
    let selector = read_document(cur, ctx, field::SELECTOR)?;
    Ok(Delete {
        zero,
        namespace,
        flags,
        selector,
    })
}

pub fn decode_kill_cursors(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<KillCursors, DecodeError> {
    let zero = read_i32(cur, ctx, field::ZERO)?;
    let count_offset = cur.position();
    let number_of_cursor_ids = read_i32(cur, ctx, field::NUMBER_OF_CURSOR_IDS)?;

    // The count is informational; ids run to the end of the message.
    let mut cursor_ids = Vec::new();
    while !cur.is_empty() {
        cursor_ids.push(read_i64(cur, ctx, field::CURSOR_ID)?);
    }
    if usize::try_from(number_of_cursor_ids).ok() != Some(cursor_ids.len()) {
        ctx.anomaly(
            Severity::Info,
            AnomalyKind::SizeMismatch,
            count_offset,
            format!(
                "numberOfCursorIDs is {number_of_cursor_ids} but {} cursor ids follow",
                cursor_ids.len()
            ),
        );
    }

    Ok(KillCursors {
        zero,
        number_of_cursor_ids,
        cursor_ids,
    })
}

pub fn decode_command(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Command, DecodeError> {
    let database = read_cstring(cur, ctx, field::DATABASE)?;
    let command_name = read_cstring(cur, ctx, field::COMMAND_NAME)?;
    let metadata = read_document(cur, ctx, field::METADATA)?;
    let command_args = read_document(cur, ctx, field::COMMAND_ARGS)?;
    Ok(Command {
        database,
        command_name,
        metadata,
        command_args,
    })
}

pub fn decode_command_reply(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<CommandReply, DecodeError> {
    let metadata = read_document(cur, ctx, field::METADATA)?;
    let command_reply = read_document(cur, ctx, field::COMMAND_REPLY)?;
    let output_docs = if cur.is_empty() {
        None
    } else {
        Some(read_document(cur, ctx, field::OUTPUT_DOCS)?)
    };
    Ok(CommandReply {
        metadata,
        command_reply,
        output_docs,
    })
}

pub fn decode_msg(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Msg, DecodeError> {
    let flags: MsgFlags = read_flags(cur, ctx, field::MSG_FLAGS)?;
    let has_checksum = flags.contains(MsgFlags::CHECKSUM_PRESENT);

    let mut sections_cur = if has_checksum { cur.without_trailer(4) } else { cur.clone() };
    let mut sections = Vec::new();
    while !sections_cur.is_empty() {
        sections.push(decode_section(&mut sections_cur, ctx)?);
    }
    cur.advance(sections_cur.position() - cur.position())?;

    let checksum = if has_checksum {
        let offset = cur.position();
        let crc = cur.read_u32_le()?;
        ctx.field(field::MSG_CHECKSUM, offset, 4, FieldValue::U32(crc));
        Some(crc)
    } else {
        None
    };

    Ok(Msg {
        flags,
        sections,
        checksum,
    })
}

fn decode_section(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<MsgSection, DecodeError> {
    let kind_offset = cur.position();
    let kind = cur.read_u8()?;
    let declared = cur.peek_i32_le().unwrap_or(0);
    let span = 1 + usize::try_from(declared).unwrap_or(0).min(cur.remaining());
    ctx.field(field::MSG_SECTION, kind_offset, span, FieldValue::None);
    ctx.field(field::MSG_SECTION_KIND, kind_offset, 1, FieldValue::U8(kind));

    if kind == SECTION_KIND_BODY {
        let document = read_document(cur, ctx, field::MSG_SECTION_BODY)?;
        return Ok(MsgSection::Body { document });
    }

    let known = kind == SECTION_KIND_DOCUMENT_SEQUENCE;
    if !known {
        ctx.anomaly(
            Severity::Warn,
            AnomalyKind::UnknownSectionKind,
            kind_offset,
            format!("Unknown section type: {kind}"),
        );
    }

    let size_offset = cur.position();
    let size = cur.read_i32_le()?;
    if size < 4 {
        return Err(DecodeError::BadSectionSize { offset: size_offset, size });
    }
    let section_end = size_offset + size as usize;
    if section_end > cur.end() {
        ctx.anomaly(
            Severity::Error,
            AnomalyKind::Truncated,
            size_offset,
            format!("section size {size} runs past the end of the message"),
        );
    }

    if !known {
        cur.advance_clamped(size as usize - 4);
        return Ok(MsgSection::Unknown { kind, size });
    }

    ctx.field(field::MSG_SECTION_SIZE, size_offset, 4, FieldValue::I32(size));
    let mut seq = cur.sub_cursor(size as usize - 4);
    let identifier = read_cstring(&mut seq, ctx, field::MSG_SECTION_DOC_SEQUENCE_ID)?;
    ctx.field(field::MSG_SECTION_DOC_SEQUENCE, seq.position(), seq.remaining(), FieldValue::None);
    let mut documents = Vec::new();
    while !seq.is_empty() {
        documents.push(read_document(&mut seq, ctx, field::DOCUMENT)?);
    }
    cur.advance_clamped(seq.position() - cur.position());

    Ok(MsgSection::DocumentSequence {
        size,
        identifier,
        documents,
    })
}

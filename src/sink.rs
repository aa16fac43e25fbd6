//! Output side of the decoder.
//!
//! Decoders never build a display tree themselves; every decoded field is
//! handed to a [`Sink`] as a `(field, byte range, value)` record and every
//! problem as an [`Anomaly`].

use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

/// Stable field identifiers used in [`FieldRecord::field`].
pub mod field {
    pub const MESSAGE_LENGTH: &str = "mongo.message_length";
    pub const REQUEST_ID: &str = "mongo.request_id";
    pub const RESPONSE_TO: &str = "mongo.response_to";
    pub const OPCODE: &str = "mongo.opcode";

    pub const FULL_COLLECTION_NAME: &str = "mongo.full_collection_name";
    pub const DATABASE_NAME: &str = "mongo.database_name";
    pub const COLLECTION_NAME: &str = "mongo.collection_name";

    pub const REPLY_FLAGS: &str = "mongo.reply.flags";
    pub const UPDATE_FLAGS: &str = "mongo.update.flags";
    pub const INSERT_FLAGS: &str = "mongo.insert.flags";
    pub const QUERY_FLAGS: &str = "mongo.query.flags";
    pub const DELETE_FLAGS: &str = "mongo.delete.flags";
    pub const MSG_FLAGS: &str = "mongo.msg.flags";

    pub const CURSOR_ID: &str = "mongo.cursor_id";
    pub const STARTING_FROM: &str = "mongo.starting_from";
    pub const NUMBER_RETURNED: &str = "mongo.number_returned";
    pub const NUMBER_TO_SKIP: &str = "mongo.number_to_skip";
    pub const NUMBER_TO_RETURN: &str = "mongo.number_to_return";
    pub const NUMBER_OF_CURSOR_IDS: &str = "mongo.number_of_cursor_ids";
    pub const MESSAGE: &str = "mongo.message";
    pub const ZERO: &str = "mongo.zero";

    pub const SELECTOR: &str = "mongo.selector";
    pub const UPDATE: &str = "mongo.update";
    pub const QUERY: &str = "mongo.query";
    pub const RETURN_FIELD_SELECTOR: &str = "mongo.return_field_selector";
    pub const DATABASE: &str = "mongo.database";
    pub const COMMAND_NAME: &str = "mongo.commandname";
    pub const METADATA: &str = "mongo.metadata";
    pub const COMMAND_ARGS: &str = "mongo.commandargs";
    pub const COMMAND_REPLY: &str = "mongo.commandreply";
    pub const OUTPUT_DOCS: &str = "mongo.outputdocs";

    pub const DOCUMENT: &str = "mongo.document";
    pub const DOCUMENT_LENGTH: &str = "mongo.document.length";
    pub const DOCUMENT_EMPTY: &str = "mongo.document.empty";
    pub const ELEMENTS: &str = "mongo.elements";
    pub const ELEMENT_NAME: &str = "mongo.element.name";
    pub const ELEMENT_TYPE: &str = "mongo.element.type";
    pub const ELEMENT_LENGTH: &str = "mongo.element.length";
    pub const VALUE_BOOLEAN: &str = "mongo.element.value.bool";
    pub const VALUE_INT32: &str = "mongo.element.value.int32";
    pub const VALUE_INT64: &str = "mongo.element.value.int64";
    pub const VALUE_DOUBLE: &str = "mongo.element.value.double";
    pub const VALUE_DATETIME: &str = "mongo.element.value.datetime";
    pub const VALUE_TIMESTAMP: &str = "mongo.element.value.timestamp";
    pub const VALUE_DECIMAL128: &str = "mongo.element.value.decimal128";
    pub const VALUE_STRING: &str = "mongo.element.value.string";
    pub const VALUE_STRING_LENGTH: &str = "mongo.element.value.length";
    pub const VALUE_BINARY: &str = "mongo.element.value.bytes";
    pub const VALUE_BINARY_LENGTH: &str = "mongo.element.value.bytes_length";
    pub const VALUE_BINARY_SUBTYPE: &str = "mongo.element.value.bytes_subtype";
    pub const VALUE_REGEX_PATTERN: &str = "mongo.element.value.regex.pattern";
    pub const VALUE_REGEX_OPTIONS: &str = "mongo.element.value.regex.options";
    pub const VALUE_OBJECTID: &str = "mongo.element.value.objectid";
    pub const VALUE_OBJECTID_TIME: &str = "mongo.element.value.objectid.time";
    pub const VALUE_OBJECTID_MACHINE_ID: &str = "mongo.element.value.objectid.machine_id";
    pub const VALUE_OBJECTID_HOST: &str = "mongo.element.value.objectid.host";
    pub const VALUE_OBJECTID_PID: &str = "mongo.element.value.objectid.pid";
    pub const VALUE_OBJECTID_INC: &str = "mongo.element.value.objectid.inc";
    pub const VALUE_DB_PTR: &str = "mongo.element.value.db_ptr";
    pub const VALUE_JS_CODE: &str = "mongo.element.value.js_code";
    pub const VALUE_JS_SCOPE: &str = "mongo.element.value.js_scope";

    pub const COMPRESSION_INFO: &str = "mongo.compression";
    pub const ORIGINAL_OPCODE: &str = "mongo.compression.original_opcode";
    pub const UNCOMPRESSED_SIZE: &str = "mongo.compression.original_size";
    pub const COMPRESSOR: &str = "mongo.compression.compressor";
    pub const COMPRESSED_DATA: &str = "mongo.compression.compressed_data";
    pub const UNSUPPORTED_COMPRESSED: &str = "mongo.compression.unsupported_compressed";

    pub const MSG_SECTION: &str = "mongo.msg.sections.section";
    pub const MSG_SECTION_KIND: &str = "mongo.msg.sections.section.kind";
    pub const MSG_SECTION_BODY: &str = "mongo.msg.sections.section.body";
    pub const MSG_SECTION_SIZE: &str = "mongo.msg.sections.section.size";
    pub const MSG_SECTION_DOC_SEQUENCE: &str = "mongo.msg.sections.section.doc_sequence";
    pub const MSG_SECTION_DOC_SEQUENCE_ID: &str = "mongo.msg.sections.section.doc_sequence_id";
    pub const MSG_CHECKSUM: &str = "mongo.msg.checksum";

    pub const UNKNOWN: &str = "mongo.unknown";
}

/// Which buffer a byte offset refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Absolute offset in the captured TCP stream.
    Wire,
    /// Offset into the buffer produced by decompressing an `OP_COMPRESSED` payload.
    Decompressed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Grouping node (a document, a section) with no scalar value of its own.
    None,
    Bool(bool),
    U8(u8),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(#[serde(serialize_with = "b64::serialize")] Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldRecord {
    pub field: Cow<'static, str>,
    pub source: DataSource,
    pub offset: u64,
    pub len: usize,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    BadLength,
    Truncated,
    RecursionExceeded,
    UnsupportedCompression,
    TooLargeCompressed,
    CompressionNesting,
    UnknownOpcode,
    TrailingBytes,
    MalformedCollectionName,
    UnknownElementType,
    UnknownSectionKind,
    InvalidUtf8,
    SizeMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub severity: Severity,
    pub kind: AnomalyKind,
    pub message: String,
    pub source: DataSource,
    pub offset: u64,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        match self.source {
            DataSource::Wire => write!(f, "[{severity}] @{}: {}", self.offset, self.message),
            DataSource::Decompressed => {
                write!(f, "[{severity}] @decompressed+{}: {}", self.offset, self.message)
            }
        }
    }
}

/// Receiver of decoded fields and anomalies.
pub trait Sink {
    fn field(&mut self, record: FieldRecord);
    fn anomaly(&mut self, anomaly: &Anomaly);
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn field(&mut self, record: FieldRecord) {
        (**self).field(record)
    }

    fn anomaly(&mut self, anomaly: &Anomaly) {
        (**self).anomaly(anomaly)
    }
}

/// Discards everything. Useful when only the returned [`Message`](crate::protocol::Message) matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Sink for NullSink {
    fn field(&mut self, _record: FieldRecord) {}
    fn anomaly(&mut self, _anomaly: &Anomaly) {}
}

/// Keeps every record in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub fields: Vec<FieldRecord>,
    pub anomalies: Vec<Anomaly>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records emitted for `field`, in order.
    pub fn find<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FieldRecord> + 'a {
        self.fields.iter().filter(move |r| r.field == field)
    }

    pub fn first(&self, field: &str) -> Option<&FieldRecord> {
        self.fields.iter().find(|r| r.field == field)
    }

    pub fn has_anomaly(&self, kind: AnomalyKind) -> bool {
        self.anomalies.iter().any(|a| a.kind == kind)
    }

    pub fn clear(&mut self) {
        self.fields.clear();
        self.anomalies.clear();
    }
}

impl Sink for RecordingSink {
    fn field(&mut self, record: FieldRecord) {
        self.fields.push(record);
    }

    fn anomaly(&mut self, anomaly: &Anomaly) {
        self.anomalies.push(anomaly.clone());
    }
}

/// Forwards anomalies to `tracing` at a level matching their severity and
/// fields at `trace` level.
#[derive(Debug, Default, Clone)]
pub struct TracingSink {
    pub stream: Option<String>,
}

impl TracingSink {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: Some(stream.into()),
        }
    }
}

impl Sink for TracingSink {
    fn field(&mut self, record: FieldRecord) {
        tracing::trace!(
            stream = self.stream.as_deref().unwrap_or("-"),
            field = %record.field,
            source = ?record.source,
            offset = record.offset,
            len = record.len,
            value = ?record.value,
            "field"
        );
    }

    fn anomaly(&mut self, anomaly: &Anomaly) {
        let stream = self.stream.as_deref().unwrap_or("-");
        match anomaly.severity {
            Severity::Info => {
                tracing::info!(stream, kind = ?anomaly.kind, source = ?anomaly.source, offset = anomaly.offset, "{}", anomaly.message)
            }
            Severity::Warn => {
                tracing::warn!(stream, kind = ?anomaly.kind, source = ?anomaly.source, offset = anomaly.offset, "{}", anomaly.message)
            }
            Severity::Error => {
                tracing::error!(stream, kind = ?anomaly.kind, source = ?anomaly.source, offset = anomaly.offset, "{}", anomaly.message)
            }
        }
    }
}

/// Byte payloads travel through JSON as base64.
pub(crate) mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::Serializer;

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes.as_ref()))
    }
}

//! MongoDB wire protocol decoding.
//! - Message header parsing
//! - Opcode dispatch, including re-entry after `OP_COMPRESSED`
//! - Legacy and `OP_MSG` body decoders
//! - Recursive BSON document decoding

pub mod compression;
pub mod context;
pub mod cursor;
pub mod dispatch;
pub mod document;
pub mod ops;

pub use context::DecodeContext;
pub use cursor::ByteCursor;
pub use dispatch::{MAX_COMPRESSION_NESTING, Message, decode_message, opcode_name};
pub use document::{BsonDocument, BsonElement, BsonValue, ElementType, ObjectId, decode_document};
pub use ops::OperationBody;

use crate::error::DecodeError;
use crate::sink::{FieldValue, field};
use serde::Serialize;

/// Size of the standard message header.
pub const HEADER_LEN: usize = 16;

pub const OP_REPLY: i32 = 1;
pub const OP_MESSAGE: i32 = 1000;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_RESERVED: i32 = 2003;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_COMMAND: i32 = 2010;
pub const OP_COMMAND_REPLY: i32 = 2011;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: i32,
}

impl MessageHeader {
    pub(crate) fn read(cur: &mut ByteCursor<'_>, ctx: &mut DecodeContext<'_>) -> Result<Self, DecodeError> {
        let start = cur.position();
        let message_length = cur.read_i32_le()?;
        let request_id = cur.read_u32_le()?;
        let response_to = cur.read_u32_le()?;
        let op_code = cur.read_i32_le()?;

        ctx.field(field::MESSAGE_LENGTH, start, 4, FieldValue::I32(message_length));
        ctx.field(field::REQUEST_ID, start + 4, 4, FieldValue::U32(request_id));
        ctx.field(field::RESPONSE_TO, start + 8, 4, FieldValue::U32(response_to));
        ctx.field(field::OPCODE, start + 12, 4, FieldValue::I32(op_code));

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }
}

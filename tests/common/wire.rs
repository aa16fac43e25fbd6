// Test-only wire encoders. The crate decodes; these build the fixtures.
#![allow(dead_code)]

use bson::Document;
use flate2::{Compression, write::ZlibEncoder};
use std::io::Write;

pub const OP_REPLY: i32 = 1;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

pub fn cstring(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

/// Prefix `body` with a 16-byte header whose length matches.
pub fn frame(op_code: i32, request_id: i32, response_to: i32, body: &[u8]) -> Vec<u8> {
    let message_length = 16 + body.len() as i32;
    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&op_code.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// OP_MSG body with a single section 0 document.
pub fn op_msg_body(doc: &Document) -> Vec<u8> {
    let mut out = 0u32.to_le_bytes().to_vec();
    out.push(0u8);
    out.extend(bson::to_vec(doc).unwrap());
    out
}

pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Vec<u8> {
    frame(OP_MSG, request_id, response_to, &op_msg_body(doc))
}

pub fn op_query_body(flags: u32, ns: &str, skip: i32, limit: i32, query: &[u8]) -> Vec<u8> {
    let mut out = flags.to_le_bytes().to_vec();
    out.extend(cstring(ns));
    out.extend_from_slice(&skip.to_le_bytes());
    out.extend_from_slice(&limit.to_le_bytes());
    out.extend_from_slice(query);
    out
}

pub fn encode_op_reply(docs: &[Document], response_to: i32, request_id: i32) -> Vec<u8> {
    let mut body = 0u32.to_le_bytes().to_vec();
    body.extend_from_slice(&0i64.to_le_bytes());
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(docs.len() as i32).to_le_bytes());
    for d in docs {
        body.extend(bson::to_vec(d).unwrap());
    }
    frame(OP_REPLY, request_id, response_to, &body)
}

pub fn compressed_body(original_opcode: i32, uncompressed_size: i32, compressor: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = original_opcode.to_le_bytes().to_vec();
    out.extend_from_slice(&uncompressed_size.to_le_bytes());
    out.push(compressor);
    out.extend_from_slice(payload);
    out
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn snappy(data: &[u8]) -> Vec<u8> {
    snap::raw::Encoder::new().compress_vec(data).unwrap()
}

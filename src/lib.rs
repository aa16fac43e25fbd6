//! Passive decoder for the MongoDB wire protocol.
//!
//! Bytes flow through [`framer::StreamFramer`] into
//! [`protocol::decode_message`], which reports every decoded field and every
//! anomaly to a [`sink::Sink`] and returns a typed [`protocol::Message`].

pub mod config;
pub mod error;
pub mod framer;
pub mod protocol;
pub mod server;
pub mod sink;

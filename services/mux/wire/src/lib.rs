//! Wire protocol for the dialog multiplexing layer.
//!
//! This crate provides the message set exchanged between two endpoints of a
//! connection, the packed-integer codec used for their fields, and the output
//! staging buffer that publishes whole messages to the transport.
//!
//! ## Features
//!
//! - **Non-blocking decode**: incomplete input is reported, never consumed
//! - **Zero-Copy payloads**: dialog payloads are `Bytes` slices of the input
//! - **Phase filtering**: callers reject message kinds invalid for their state
//! - **Atomic chunks**: a message is visible to the flush path only once complete
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------------------+
//! | u8 identifier        | message kind + flags (finish/cont/sample)|
//! +----------------------+------------------------------------------+
//! | magic (4B)           | handshake messages only                  |
//! +----------------------+------------------------------------------+
//! | packed fields        | zig-zag LEB128 integers                  |
//! +----------------------+------------------------------------------+
//! | packed length        | validated against the max length         |
//! +----------------------+------------------------------------------+
//! | payload / utf-8      | variable (0..max length)                 |
//! +----------------------+------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod packed;

// Re-export main types
pub use chunk::{ChunkWriter, OutputStaging, INLINE_PAYLOAD_LIMIT};
pub use codec::{MessageDecoder, DEFAULT_MAX_LENGTH};
pub use error::WireError;
pub use frame::{ConnectionLimits, ProtocolMessage, WireSink};
pub use header::{
    ConnectionAbortCause, DialogAbortCause, FrameFlags, MessageKind, MAGIC_NUMBER,
    MIN_PROTOCOL_VERSION, PING_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use packed::{decode_packed, encode_packed, packed_len, MAX_PACKED_LEN};

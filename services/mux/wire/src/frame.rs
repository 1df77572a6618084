//! Protocol messages and their encoding.
//!
//! A message is `[identifier][fields...]`. Integer fields are packed, strings
//! and payloads are preceded by their packed length.

use crate::header::*;
use crate::packed::{encode_packed, MAX_PACKED_LEN};
use bytes::{BufMut, Bytes, BytesMut};

/// Destination for encoded message bytes
pub trait WireSink {
    /// Append one byte
    fn put_byte(&mut self, value: u8);

    /// Append a copy of `src`
    fn put_raw(&mut self, src: &[u8]);

    /// Append a payload; sinks may keep a reference instead of copying
    fn put_payload(&mut self, payload: &Bytes) {
        self.put_raw(payload);
    }

    /// Append a packed integer
    fn put_packed(&mut self, value: i64) {
        let mut scratch = [0u8; MAX_PACKED_LEN];
        let n = encode_packed(value, &mut scratch);
        self.put_raw(&scratch[..n]);
    }
}

impl WireSink for BytesMut {
    fn put_byte(&mut self, value: u8) {
        self.put_u8(value);
    }

    fn put_raw(&mut self, src: &[u8]) {
        self.put_slice(src);
    }
}

impl WireSink for Vec<u8> {
    fn put_byte(&mut self, value: u8) {
        self.push(value);
    }

    fn put_raw(&mut self, src: &[u8]) {
        self.extend_from_slice(src);
    }
}

/// Limits one side advertises during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Maximum concurrently open dialogs the peer may start
    pub max_dialogs: u32,
    /// Maximum length of one frame payload
    pub max_length: u32,
    /// Maximum total length of one dialog message
    pub max_total_length: u32,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u32,
}

/// A decoded or to-be-encoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Creator's protocol version
    ProtocolVersion {
        /// Highest version the creator speaks
        version: u64,
    },
    /// Responder's chosen protocol version
    ProtocolVersionResponse {
        /// Version both sides will use
        version: u64,
    },
    /// Creator's connection ID and limits
    ConnectionConfig {
        /// Connection ID chosen by the creator
        connection_id: u64,
        /// Limits the creator enforces on dialogs the responder starts
        limits: ConnectionLimits,
    },
    /// Responder's limits
    ConnectionConfigResponse {
        /// Limits the responder enforces on dialogs the creator starts
        limits: ConnectionLimits,
    },
    /// Heartbeat for version 1 peers
    NoOperation,
    /// Fatal connection abort
    ConnectionAbort {
        /// Abort reason
        cause: ConnectionAbortCause,
        /// Human readable detail
        detail: String,
    },
    /// Heartbeat request
    Ping {
        /// Opaque cookie echoed by PING_ACK
        cookie: u64,
    },
    /// Heartbeat answer
    PingAck {
        /// Cookie of the answered PING
        cookie: u64,
    },
    /// First frame of a dialog
    DialogStart {
        /// Dialog is sampled for tracing
        sampled: bool,
        /// Last frame written by the starter
        finish: bool,
        /// More frames of the same message follow
        cont: bool,
        /// Dialog type number
        type_no: i32,
        /// Dialog ID assigned by the starter
        dialog_id: i64,
        /// Dialog timeout in milliseconds
        timeout_millis: u64,
        /// Frame payload
        payload: Bytes,
    },
    /// Subsequent dialog frame
    DialogFrame {
        /// Last frame written by this side
        finish: bool,
        /// More frames of the same message follow
        cont: bool,
        /// Dialog ID
        dialog_id: i64,
        /// Frame payload
        payload: Bytes,
    },
    /// Dialog abort
    DialogAbort {
        /// Abort reason
        cause: DialogAbortCause,
        /// Dialog ID
        dialog_id: i64,
        /// Human readable detail
        detail: String,
    },
}

impl ProtocolMessage {
    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::ProtocolVersion { .. } => MessageKind::ProtocolVersion,
            ProtocolMessage::ProtocolVersionResponse { .. } => {
                MessageKind::ProtocolVersionResponse
            }
            ProtocolMessage::ConnectionConfig { .. } => MessageKind::ConnectionConfig,
            ProtocolMessage::ConnectionConfigResponse { .. } => {
                MessageKind::ConnectionConfigResponse
            }
            ProtocolMessage::NoOperation => MessageKind::NoOperation,
            ProtocolMessage::ConnectionAbort { .. } => MessageKind::ConnectionAbort,
            ProtocolMessage::Ping { .. } => MessageKind::Ping,
            ProtocolMessage::PingAck { .. } => MessageKind::PingAck,
            ProtocolMessage::DialogStart { .. } => MessageKind::DialogStart,
            ProtocolMessage::DialogFrame { .. } => MessageKind::DialogFrame,
            ProtocolMessage::DialogAbort { .. } => MessageKind::DialogAbort,
        }
    }

    /// Whether nothing may follow this message on the connection
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolMessage::ConnectionAbort { .. })
    }

    /// Encode this message into `sink`
    pub fn encode<S: WireSink + ?Sized>(&self, sink: &mut S) {
        match self {
            ProtocolMessage::ProtocolVersion { version } => {
                sink.put_byte(ID_PROTOCOL_VERSION);
                sink.put_raw(&MAGIC_NUMBER);
                sink.put_packed(*version as i64);
            }
            ProtocolMessage::ProtocolVersionResponse { version } => {
                sink.put_byte(ID_PROTOCOL_VERSION_RESPONSE);
                sink.put_raw(&MAGIC_NUMBER);
                sink.put_packed(*version as i64);
            }
            ProtocolMessage::ConnectionConfig {
                connection_id,
                limits,
            } => {
                sink.put_byte(ID_CONNECTION_CONFIG);
                sink.put_packed(*connection_id as i64);
                put_limits(sink, limits);
            }
            ProtocolMessage::ConnectionConfigResponse { limits } => {
                sink.put_byte(ID_CONNECTION_CONFIG_RESPONSE);
                put_limits(sink, limits);
            }
            ProtocolMessage::NoOperation => sink.put_byte(ID_NO_OPERATION),
            ProtocolMessage::ConnectionAbort { cause, detail } => {
                sink.put_byte(ID_CONNECTION_ABORT);
                sink.put_byte(*cause as u8);
                put_str(sink, detail);
            }
            ProtocolMessage::Ping { cookie } => {
                sink.put_byte(ID_PING);
                sink.put_packed(*cookie as i64);
            }
            ProtocolMessage::PingAck { cookie } => {
                sink.put_byte(ID_PING_ACK);
                sink.put_packed(*cookie as i64);
            }
            ProtocolMessage::DialogStart {
                sampled,
                finish,
                cont,
                type_no,
                dialog_id,
                timeout_millis,
                payload,
            } => {
                let mut flags = dialog_flags(*finish, *cont);
                flags.set(FrameFlags::SAMPLED, *sampled);
                sink.put_byte(ID_DIALOG_START | flags.bits());
                sink.put_packed(*type_no as i64);
                sink.put_packed(*dialog_id);
                sink.put_packed(*timeout_millis as i64);
                sink.put_packed(payload.len() as i64);
                sink.put_payload(payload);
            }
            ProtocolMessage::DialogFrame {
                finish,
                cont,
                dialog_id,
                payload,
            } => {
                sink.put_byte(ID_DIALOG_FRAME | dialog_flags(*finish, *cont).bits());
                sink.put_packed(*dialog_id);
                sink.put_packed(payload.len() as i64);
                sink.put_payload(payload);
            }
            ProtocolMessage::DialogAbort {
                cause,
                dialog_id,
                detail,
            } => {
                sink.put_byte(ID_DIALOG_ABORT);
                sink.put_byte(*cause as u8);
                sink.put_packed(*dialog_id);
                put_str(sink, detail);
            }
        }
    }

    /// Encode this message into a standalone buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn dialog_flags(finish: bool, cont: bool) -> FrameFlags {
    let mut flags = FrameFlags::empty();
    flags.set(FrameFlags::FINISH, finish);
    flags.set(FrameFlags::CONTINUATION, cont);
    flags
}

fn put_limits<S: WireSink + ?Sized>(sink: &mut S, limits: &ConnectionLimits) {
    sink.put_packed(limits.max_dialogs as i64);
    sink.put_packed(limits.max_length as i64);
    sink.put_packed(limits.max_total_length as i64);
    sink.put_packed(limits.heartbeat_interval as i64);
}

fn put_str<S: WireSink + ?Sized>(sink: &mut S, value: &str) {
    sink.put_packed(value.len() as i64);
    sink.put_raw(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialog_frame_layout() {
        let msg = ProtocolMessage::DialogFrame {
            finish: true,
            cont: false,
            dialog_id: -1,
            payload: Bytes::from_static(b"abc"),
        };
        // identifier with FINISH, zig-zag(-1) = 1, length 3 -> 6, payload
        assert_eq!(
            msg.to_bytes().as_ref(),
            &[0x92, 0x01, 0x06, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_handshake_carries_magic() {
        let bytes = ProtocolMessage::ProtocolVersion { version: 2 }.to_bytes();
        assert_eq!(bytes[0], ID_PROTOCOL_VERSION);
        assert_eq!(&bytes[1..5], &MAGIC_NUMBER);
        assert_eq!(bytes[5], 0x04);
    }

    #[test]
    fn test_terminal_messages() {
        let abort = ProtocolMessage::ConnectionAbort {
            cause: ConnectionAbortCause::EndpointShutdown,
            detail: String::new(),
        };
        assert!(abort.is_terminal());
        assert!(!ProtocolMessage::NoOperation.is_terminal());
        assert_eq!(abort.kind(), MessageKind::ConnectionAbort);
    }
}

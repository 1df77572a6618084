//! Identifier bytes, message kinds, flags and abort causes.
//!
//! Every protocol message starts with one identifier byte. The high bits name
//! the message; dialog messages carry their flags in the low bits.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Magic number written after the identifier of handshake messages
pub const MAGIC_NUMBER: [u8; 4] = [0x44, 0x4C, 0x47, 0x4D];

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u64 = 2;

/// Oldest protocol version still accepted
pub const MIN_PROTOCOL_VERSION: u64 = 1;

/// First version that uses PING/PING_ACK heartbeats instead of NO_OPERATION
pub const PING_PROTOCOL_VERSION: u64 = 2;

/// Identifier of PROTOCOL_VERSION
pub const ID_PROTOCOL_VERSION: u8 = 0x10;
/// Identifier of PROTOCOL_VERSION_RESPONSE
pub const ID_PROTOCOL_VERSION_RESPONSE: u8 = 0x11;
/// Identifier of CONNECTION_CONFIG
pub const ID_CONNECTION_CONFIG: u8 = 0x20;
/// Identifier of CONNECTION_CONFIG_RESPONSE
pub const ID_CONNECTION_CONFIG_RESPONSE: u8 = 0x21;
/// Identifier of NO_OPERATION
pub const ID_NO_OPERATION: u8 = 0x30;
/// Identifier of CONNECTION_ABORT
pub const ID_CONNECTION_ABORT: u8 = 0x38;
/// Identifier of PING
pub const ID_PING: u8 = 0x40;
/// Identifier of PING_ACK
pub const ID_PING_ACK: u8 = 0x41;
/// Base identifier of DIALOG_START (low three bits are flags)
pub const ID_DIALOG_START: u8 = 0x80;
/// Base identifier of DIALOG_FRAME (low two bits are flags)
pub const ID_DIALOG_FRAME: u8 = 0x90;
/// Identifier of DIALOG_ABORT
pub const ID_DIALOG_ABORT: u8 = 0xA0;

/// Message kinds as identified by the leading byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Creator announces its protocol version
    ProtocolVersion,
    /// Responder answers with the version to use
    ProtocolVersionResponse,
    /// Creator announces connection ID and limits
    ConnectionConfig,
    /// Responder answers with its limits
    ConnectionConfigResponse,
    /// Heartbeat for version 1 peers
    NoOperation,
    /// Fatal connection abort
    ConnectionAbort,
    /// Heartbeat request
    Ping,
    /// Heartbeat answer
    PingAck,
    /// First frame of a dialog
    DialogStart,
    /// Subsequent dialog frame
    DialogFrame,
    /// Dialog abort
    DialogAbort,
}

impl MessageKind {
    /// Split an identifier byte into the message kind and its flag bits
    pub fn from_identifier(id: u8) -> Result<(Self, FrameFlags), crate::WireError> {
        let kind = match id {
            ID_PROTOCOL_VERSION => MessageKind::ProtocolVersion,
            ID_PROTOCOL_VERSION_RESPONSE => MessageKind::ProtocolVersionResponse,
            ID_CONNECTION_CONFIG => MessageKind::ConnectionConfig,
            ID_CONNECTION_CONFIG_RESPONSE => MessageKind::ConnectionConfigResponse,
            ID_NO_OPERATION => MessageKind::NoOperation,
            ID_CONNECTION_ABORT => MessageKind::ConnectionAbort,
            ID_PING => MessageKind::Ping,
            ID_PING_ACK => MessageKind::PingAck,
            ID_DIALOG_ABORT => MessageKind::DialogAbort,
            _ if id & !DIALOG_START_FLAG_MASK == ID_DIALOG_START => {
                return Ok((MessageKind::DialogStart, FrameFlags::from_bits_truncate(id)));
            }
            _ if id & !DIALOG_FRAME_FLAG_MASK == ID_DIALOG_FRAME => {
                return Ok((MessageKind::DialogFrame, FrameFlags::from_bits_truncate(id)));
            }
            _ => return Err(crate::WireError::UnknownIdentifier(id)),
        };
        Ok((kind, FrameFlags::empty()))
    }

    /// Whether this kind belongs to the handshake
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageKind::ProtocolVersion
                | MessageKind::ProtocolVersionResponse
                | MessageKind::ConnectionConfig
                | MessageKind::ConnectionConfigResponse
        )
    }
}

const DIALOG_START_FLAG_MASK: u8 = 0x07;
const DIALOG_FRAME_FLAG_MASK: u8 = 0x03;

bitflags! {
    /// Flag bits carried in the identifier byte of dialog messages
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FrameFlags: u8 {
        /// More frames of the same message follow
        const CONTINUATION = 1 << 0;
        /// Last frame written by this side of the dialog
        const FINISH = 1 << 1;
        /// Dialog is sampled for tracing (DIALOG_START only)
        const SAMPLED = 1 << 2;
    }
}

/// Reasons carried by CONNECTION_ABORT
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionAbortCause {
    /// Unclassified failure
    UnknownReason = 0,
    /// Remote endpoint is shutting down
    EndpointShutdown = 1,
    /// Heartbeat or connect timeout
    Timeout = 2,
    /// No dialog for an idle interval
    IdleTimeout = 3,
    /// Protocol versions or security settings do not match
    Incompatible = 4,
    /// Peer sent a malformed or out-of-phase message
    ProtocolViolation = 5,
}

impl TryFrom<u8> for ConnectionAbortCause {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionAbortCause::UnknownReason),
            1 => Ok(ConnectionAbortCause::EndpointShutdown),
            2 => Ok(ConnectionAbortCause::Timeout),
            3 => Ok(ConnectionAbortCause::IdleTimeout),
            4 => Ok(ConnectionAbortCause::Incompatible),
            5 => Ok(ConnectionAbortCause::ProtocolViolation),
            _ => Err(crate::WireError::malformed(format!(
                "unknown connection abort cause {}",
                value
            ))),
        }
    }
}

/// Reasons carried by DIALOG_ABORT
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogAbortCause {
    /// Unclassified failure, including local cancellation
    UnknownReason = 0,
    /// Deprecated: the connection went away. Never written by this implementation.
    ConnectionAbort = 1,
    /// Endpoint refused the dialog because it is shutting down
    EndpointShuttingDown = 2,
    /// Dialog timed out
    TimedOut = 3,
    /// No handler registered for the dialog type
    UnknownType = 4,
}

impl TryFrom<u8> for DialogAbortCause {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DialogAbortCause::UnknownReason),
            1 => Ok(DialogAbortCause::ConnectionAbort),
            2 => Ok(DialogAbortCause::EndpointShuttingDown),
            3 => Ok(DialogAbortCause::TimedOut),
            4 => Ok(DialogAbortCause::UnknownType),
            _ => Err(crate::WireError::malformed(format!(
                "unknown dialog abort cause {}",
                value
            ))),
        }
    }
}

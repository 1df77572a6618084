//! Wire protocol error types.

use crate::header::MessageKind;
use thiserror::Error;

/// Wire protocol errors.
///
/// Running out of input is not an error: decoders report it as `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Leading identifier byte does not name any message
    #[error("unknown identifier 0x{0:02x}")]
    UnknownIdentifier(u8),

    /// Message is valid but not allowed in the current connection phase
    #[error("unexpected message type {0:?}")]
    UnexpectedMessage(MessageKind),

    /// Handshake magic number mismatch
    #[error("incompatible protocol: {0}")]
    Incompatible(String),

    /// A length field exceeds the negotiated maximum
    #[error("max length exceeded: {len} > {max}")]
    MaxLengthExceeded {
        /// Declared length
        len: i64,
        /// Allowed maximum
        max: u32,
    },

    /// Malformed field
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl WireError {
    /// Shorthand for a malformed field error
    pub fn malformed(detail: impl Into<String>) -> Self {
        WireError::Malformed(detail.into())
    }
}

//! Decoding of protocol messages from a byte stream.
//!
//! The decoder never blocks and never consumes a partial message: when the
//! buffer ends early it reports `Ok(None)` and leaves the buffer untouched.

use crate::error::WireError;
use crate::frame::{ConnectionLimits, ProtocolMessage};
use crate::header::*;
use crate::packed::decode_packed;
use bytes::{Bytes, BytesMut};
use std::ops::Range;

/// Default maximum length of one length-prefixed field
pub const DEFAULT_MAX_LENGTH: u32 = 64 * 1024;

/// Unwrap a cursor read, or report "need more data"
macro_rules! ready {
    ($e:expr) => {
        match $e {
            Some(value) => value,
            None => return Ok(None),
        }
    };
}

/// Message decoder for parsing incoming messages
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    max_length: u32,
}

impl MessageDecoder {
    /// Create a decoder that accepts fields up to `max_length` bytes
    pub fn new(max_length: u32) -> Self {
        Self { max_length }
    }

    /// Current length limit
    pub fn max_length(&self) -> u32 {
        self.max_length
    }

    /// Change the length limit, e.g. after the handshake
    pub fn set_max_length(&mut self, max_length: u32) {
        self.max_length = max_length;
    }

    /// Decode one message, accepting any kind
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<ProtocolMessage>, WireError> {
        self.decode_filtered(buf, |_| true)
    }

    /// Decode one message from the front of `buf`.
    ///
    /// `accept` rejects kinds that are not valid in the caller's current phase;
    /// a rejected kind yields [`WireError::UnexpectedMessage`].
    pub fn decode_filtered<F>(
        &self,
        buf: &mut BytesMut,
        accept: F,
    ) -> Result<Option<ProtocolMessage>, WireError>
    where
        F: Fn(MessageKind) -> bool,
    {
        let mut cursor = Cursor::new(&buf[..]);
        let (mut message, payload) = ready!(self.parse(&mut cursor, &accept)?);
        let consumed = cursor.pos;

        let raw = buf.split_to(consumed).freeze();
        if let Some(range) = payload {
            attach_payload(&mut message, raw.slice(range));
        }
        Ok(Some(message))
    }

    fn parse<F>(
        &self,
        cur: &mut Cursor<'_>,
        accept: &F,
    ) -> Result<Option<(ProtocolMessage, Option<Range<usize>>)>, WireError>
    where
        F: Fn(MessageKind) -> bool,
    {
        let id = ready!(cur.byte());
        let (kind, flags) = MessageKind::from_identifier(id)?;
        if !accept(kind) {
            return Err(WireError::UnexpectedMessage(kind));
        }

        let message = match kind {
            MessageKind::ProtocolVersion | MessageKind::ProtocolVersionResponse => {
                let range = ready!(cur.take(MAGIC_NUMBER.len()));
                let magic = cur.slice(range);
                if magic != &MAGIC_NUMBER[..] {
                    return Err(WireError::Incompatible(format!(
                        "bad magic number {:02x?}",
                        magic
                    )));
                }
                let version = non_negative(ready!(cur.packed()?), "version")?;
                if kind == MessageKind::ProtocolVersion {
                    ProtocolMessage::ProtocolVersion { version }
                } else {
                    ProtocolMessage::ProtocolVersionResponse { version }
                }
            }
            MessageKind::ConnectionConfig => {
                let connection_id = non_negative(ready!(cur.packed()?), "connection id")?;
                let limits = ready!(self.limits(cur)?);
                ProtocolMessage::ConnectionConfig {
                    connection_id,
                    limits,
                }
            }
            MessageKind::ConnectionConfigResponse => {
                let limits = ready!(self.limits(cur)?);
                ProtocolMessage::ConnectionConfigResponse { limits }
            }
            MessageKind::NoOperation => ProtocolMessage::NoOperation,
            MessageKind::ConnectionAbort => {
                let cause = ConnectionAbortCause::try_from(ready!(cur.byte()))?;
                let detail = ready!(self.string(cur)?);
                ProtocolMessage::ConnectionAbort { cause, detail }
            }
            MessageKind::Ping => ProtocolMessage::Ping {
                cookie: ready!(cur.packed()?) as u64,
            },
            MessageKind::PingAck => ProtocolMessage::PingAck {
                cookie: ready!(cur.packed()?) as u64,
            },
            MessageKind::DialogStart => {
                let (finish, cont) = finish_and_cont(flags)?;
                let type_no = ready!(cur.packed()?);
                let type_no = i32::try_from(type_no)
                    .map_err(|_| WireError::malformed(format!("type number {}", type_no)))?;
                let dialog_id = dialog_id(ready!(cur.packed()?))?;
                let timeout_millis = non_negative(ready!(cur.packed()?), "timeout")?;
                let len = ready!(self.length(cur)?);
                let payload = ready!(cur.take(len));
                return Ok(Some((
                    ProtocolMessage::DialogStart {
                        sampled: flags.contains(FrameFlags::SAMPLED),
                        finish,
                        cont,
                        type_no,
                        dialog_id,
                        timeout_millis,
                        payload: Bytes::new(),
                    },
                    Some(payload),
                )));
            }
            MessageKind::DialogFrame => {
                let (finish, cont) = finish_and_cont(flags)?;
                let dialog_id = dialog_id(ready!(cur.packed()?))?;
                let len = ready!(self.length(cur)?);
                let payload = ready!(cur.take(len));
                return Ok(Some((
                    ProtocolMessage::DialogFrame {
                        finish,
                        cont,
                        dialog_id,
                        payload: Bytes::new(),
                    },
                    Some(payload),
                )));
            }
            MessageKind::DialogAbort => {
                let cause = DialogAbortCause::try_from(ready!(cur.byte()))?;
                let dialog_id = dialog_id(ready!(cur.packed()?))?;
                let detail = ready!(self.string(cur)?);
                ProtocolMessage::DialogAbort {
                    cause,
                    dialog_id,
                    detail,
                }
            }
        };
        Ok(Some((message, None)))
    }

    fn length(&self, cur: &mut Cursor<'_>) -> Result<Option<usize>, WireError> {
        let len = ready!(cur.packed()?);
        if len < 0 {
            return Err(WireError::malformed(format!("negative length {}", len)));
        }
        if len > self.max_length as i64 {
            return Err(WireError::MaxLengthExceeded {
                len,
                max: self.max_length,
            });
        }
        Ok(Some(len as usize))
    }

    fn string(&self, cur: &mut Cursor<'_>) -> Result<Option<String>, WireError> {
        let len = ready!(self.length(cur)?);
        let range = ready!(cur.take(len));
        let text = std::str::from_utf8(cur.slice(range))
            .map_err(|e| WireError::malformed(format!("invalid utf-8: {}", e)))?;
        Ok(Some(text.to_string()))
    }

    fn limits(&self, cur: &mut Cursor<'_>) -> Result<Option<ConnectionLimits>, WireError> {
        let max_dialogs = limit(ready!(cur.packed()?), "max dialogs")?;
        let max_length = limit(ready!(cur.packed()?), "max length")?;
        let max_total_length = limit(ready!(cur.packed()?), "max total length")?;
        let heartbeat_interval = limit(ready!(cur.packed()?), "heartbeat interval")?;
        Ok(Some(ConnectionLimits {
            max_dialogs,
            max_length,
            max_total_length,
            heartbeat_interval,
        }))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LENGTH)
    }
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn byte(&mut self) -> Option<u8> {
        let b = *self.src.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn packed(&mut self) -> Result<Option<i64>, WireError> {
        let (value, n) = ready!(decode_packed(&self.src[self.pos..])?);
        self.pos += n;
        Ok(Some(value))
    }

    fn take(&mut self, n: usize) -> Option<Range<usize>> {
        if self.src.len() - self.pos < n {
            return None;
        }
        let start = self.pos;
        self.pos += n;
        Some(start..self.pos)
    }

    fn slice(&self, range: Range<usize>) -> &'a [u8] {
        &self.src[range]
    }
}

fn attach_payload(message: &mut ProtocolMessage, bytes: Bytes) {
    match message {
        ProtocolMessage::DialogStart { payload, .. } | ProtocolMessage::DialogFrame { payload, .. } => {
            *payload = bytes;
        }
        _ => {}
    }
}

fn finish_and_cont(flags: FrameFlags) -> Result<(bool, bool), WireError> {
    let finish = flags.contains(FrameFlags::FINISH);
    let cont = flags.contains(FrameFlags::CONTINUATION);
    if finish && cont {
        return Err(WireError::malformed("finish and continuation both set"));
    }
    Ok((finish, cont))
}

fn dialog_id(value: i64) -> Result<i64, WireError> {
    if value == 0 {
        return Err(WireError::malformed("dialog id is zero"));
    }
    Ok(value)
}

fn non_negative(value: i64, what: &str) -> Result<u64, WireError> {
    u64::try_from(value).map_err(|_| WireError::malformed(format!("negative {}: {}", what, value)))
}

fn limit(value: i64, what: &str) -> Result<u32, WireError> {
    u32::try_from(value).map_err(|_| WireError::malformed(format!("{} out of range: {}", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            max_dialogs: 100,
            max_length: 4096,
            max_total_length: 1 << 20,
            heartbeat_interval: 1000,
        }
    }

    fn all_messages() -> Vec<ProtocolMessage> {
        vec![
            ProtocolMessage::ProtocolVersion { version: 2 },
            ProtocolMessage::ProtocolVersionResponse { version: 1 },
            ProtocolMessage::ConnectionConfig {
                connection_id: 0x7FFF_FFFF_FFFF_FFFF,
                limits: limits(),
            },
            ProtocolMessage::ConnectionConfigResponse { limits: limits() },
            ProtocolMessage::NoOperation,
            ProtocolMessage::ConnectionAbort {
                cause: ConnectionAbortCause::IdleTimeout,
                detail: "idle for 10s".to_string(),
            },
            ProtocolMessage::Ping { cookie: u64::MAX },
            ProtocolMessage::PingAck { cookie: 7 },
            ProtocolMessage::DialogStart {
                sampled: true,
                finish: false,
                cont: true,
                type_no: 5,
                dialog_id: 1,
                timeout_millis: 1000,
                payload: Bytes::from_static(b"0123456789"),
            },
            ProtocolMessage::DialogFrame {
                finish: true,
                cont: false,
                dialog_id: -42,
                payload: Bytes::new(),
            },
            ProtocolMessage::DialogAbort {
                cause: DialogAbortCause::UnknownType,
                dialog_id: -3,
                detail: "no handler for type 99".to_string(),
            },
        ]
    }

    #[test]
    fn test_every_message_decodes_to_itself() {
        let decoder = MessageDecoder::default();
        let mut buf = BytesMut::new();
        for msg in all_messages() {
            msg.encode(&mut buf);
        }
        for expected in all_messages() {
            let decoded = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, expected);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_message_consumes_nothing() {
        let decoder = MessageDecoder::default();
        for msg in all_messages() {
            let bytes = msg.to_bytes();
            for cut in 0..bytes.len() {
                let mut buf = BytesMut::from(&bytes[..cut]);
                assert_eq!(decoder.decode(&mut buf).unwrap(), None, "{:?} cut at {}", msg, cut);
                assert_eq!(buf.len(), cut);
            }
        }
    }

    #[test]
    fn test_finish_and_continuation_rejected() {
        let decoder = MessageDecoder::default();
        let mut buf = BytesMut::from(&[ID_DIALOG_FRAME | 0x03, 0x02, 0x00][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_zero_dialog_id_rejected() {
        let decoder = MessageDecoder::default();
        let mut buf = BytesMut::from(&[ID_DIALOG_FRAME, 0x00, 0x00][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_negative_length_rejected() {
        let decoder = MessageDecoder::default();
        // dialog id 1, length -1
        let mut buf = BytesMut::from(&[ID_DIALOG_FRAME, 0x02, 0x01][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_length_checked_before_payload_arrives() {
        let decoder = MessageDecoder::new(8);
        let msg = ProtocolMessage::DialogFrame {
            finish: false,
            cont: false,
            dialog_id: 1,
            payload: Bytes::from(vec![0u8; 9]),
        };
        let bytes = msg.to_bytes();
        // only the header, payload still missing
        let mut buf = BytesMut::from(&bytes[..3]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(WireError::MaxLengthExceeded { len: 9, max: 8 })
        );
    }

    #[test]
    fn test_bad_magic_is_incompatible() {
        let decoder = MessageDecoder::default();
        let mut buf = BytesMut::from(&[ID_PROTOCOL_VERSION, b'H', b'T', b'T', b'P', 0x04][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Incompatible(_))));
    }

    #[test]
    fn test_unknown_identifier() {
        let decoder = MessageDecoder::default();
        let mut buf = BytesMut::from(&[0x01u8][..]);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::UnknownIdentifier(0x01)));
    }

    #[test]
    fn test_phase_filter_reports_unexpected_kind() {
        let decoder = MessageDecoder::default();
        let mut buf = BytesMut::new();
        ProtocolMessage::Ping { cookie: 1 }.encode(&mut buf);
        let result = decoder.decode_filtered(&mut buf, |kind| kind.is_handshake());
        assert_eq!(result, Err(WireError::UnexpectedMessage(MessageKind::Ping)));
    }

    #[test]
    fn test_payload_is_zero_copy_slice() {
        let decoder = MessageDecoder::default();
        let msg = ProtocolMessage::DialogFrame {
            finish: false,
            cont: true,
            dialog_id: 9,
            payload: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        ProtocolMessage::NoOperation.encode(&mut buf);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(buf.as_ref(), &[ID_NO_OPERATION]);
    }
}

//! Output staging for serialized messages.
//!
//! Each protocol message is built as one chunk by a [`ChunkWriter`]. The chunk
//! only becomes visible to the flush path when [`ChunkWriter::done`] publishes
//! it, so concurrent producers never interleave partial messages.

use crate::frame::{ProtocolMessage, WireSink};
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Payloads at least this long are referenced instead of copied
pub const INLINE_PAYLOAD_LIMIT: usize = 256;

#[derive(Debug, Default)]
struct StagingInner {
    slices: Vec<Bytes>,
    bytes: usize,
    closed: bool,
    terminated: bool,
}

/// Connection-wide list of published chunk slices
#[derive(Debug, Default)]
pub struct OutputStaging {
    inner: Mutex<StagingInner>,
}

impl OutputStaging {
    /// Create an empty staging buffer
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StagingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start building a regular chunk
    pub fn chunk(&self) -> ChunkWriter<'_> {
        ChunkWriter::new(self, false)
    }

    /// Encode `message` as one chunk and publish it
    pub fn write_message(&self, message: &ProtocolMessage) -> bool {
        let mut chunk = ChunkWriter::new(self, message.is_terminal());
        message.encode(&mut chunk);
        chunk.done()
    }

    /// Move every published slice out for the transport
    pub fn fetch(&self) -> Vec<Bytes> {
        let mut inner = self.lock();
        inner.bytes = 0;
        std::mem::take(&mut inner.slices)
    }

    /// Bytes published and not yet fetched
    pub fn pending_bytes(&self) -> usize {
        self.lock().bytes
    }

    /// Whether nothing is waiting to be fetched
    pub fn is_empty(&self) -> bool {
        self.lock().slices.is_empty()
    }

    /// Refuse every later chunk; already published slices stay fetchable
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn publish(&self, slices: SmallVec<[Bytes; 4]>, terminal: bool) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.terminated {
            trace!(
                "Discarding chunk of {} slices: staging closed={} terminated={}",
                slices.len(),
                inner.closed,
                inner.terminated
            );
            return false;
        }
        inner.terminated = terminal;
        for slice in slices {
            inner.bytes += slice.len();
            inner.slices.push(slice);
        }
        true
    }
}

/// Builder for one chunk
#[derive(Debug)]
pub struct ChunkWriter<'a> {
    staging: &'a OutputStaging,
    buf: BytesMut,
    slices: SmallVec<[Bytes; 4]>,
    terminal: bool,
}

impl<'a> ChunkWriter<'a> {
    fn new(staging: &'a OutputStaging, terminal: bool) -> Self {
        Self {
            staging,
            buf: BytesMut::new(),
            slices: SmallVec::new(),
            terminal,
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len() + self.slices.iter().map(Bytes::len).sum::<usize>()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn seal(&mut self) {
        if !self.buf.is_empty() {
            self.slices.push(self.buf.split().freeze());
        }
    }

    /// Publish the chunk. Returns false when it was discarded because the
    /// staging buffer is closed or already holds a terminal chunk.
    pub fn done(mut self) -> bool {
        self.seal();
        let slices = std::mem::take(&mut self.slices);
        self.staging.publish(slices, self.terminal)
    }
}

impl WireSink for ChunkWriter<'_> {
    fn put_byte(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    fn put_raw(&mut self, src: &[u8]) {
        self.buf.extend_from_slice(src);
    }

    fn put_payload(&mut self, payload: &Bytes) {
        if payload.len() < INLINE_PAYLOAD_LIMIT {
            self.put_raw(payload);
            return;
        }
        self.seal();
        self.slices.push(payload.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageDecoder;
    use crate::header::ConnectionAbortCause;

    fn concat(slices: Vec<Bytes>) -> BytesMut {
        let mut out = BytesMut::new();
        for s in slices {
            out.extend_from_slice(&s);
        }
        out
    }

    #[test]
    fn test_chunk_invisible_until_done() {
        let staging = OutputStaging::new();
        let mut chunk = staging.chunk();
        ProtocolMessage::Ping { cookie: 3 }.encode(&mut chunk);
        assert!(staging.is_empty());
        assert!(chunk.done());
        assert!(!staging.is_empty());
        assert_eq!(staging.pending_bytes(), 2);
    }

    #[test]
    fn test_large_payload_is_referenced() {
        let staging = OutputStaging::new();
        let payload = Bytes::from(vec![7u8; INLINE_PAYLOAD_LIMIT * 2]);
        let msg = ProtocolMessage::DialogFrame {
            finish: false,
            cont: false,
            dialog_id: 4,
            payload: payload.clone(),
        };
        assert!(staging.write_message(&msg));
        let slices = staging.fetch();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].as_ptr(), payload.as_ptr());

        let mut wire = concat(slices);
        let decoded = MessageDecoder::new(4096).decode(&mut wire).unwrap();
        assert_eq!(decoded, Some(msg));
    }

    #[test]
    fn test_nothing_after_terminal_chunk() {
        let staging = OutputStaging::new();
        assert!(staging.write_message(&ProtocolMessage::ConnectionAbort {
            cause: ConnectionAbortCause::ProtocolViolation,
            detail: "bad frame".into(),
        }));
        assert!(!staging.write_message(&ProtocolMessage::NoOperation));

        let mut wire = concat(staging.fetch());
        let decoder = MessageDecoder::default();
        assert!(matches!(
            decoder.decode(&mut wire).unwrap(),
            Some(ProtocolMessage::ConnectionAbort { .. })
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_closed_staging_discards() {
        let staging = OutputStaging::new();
        assert!(staging.write_message(&ProtocolMessage::NoOperation));
        staging.close();
        assert!(!staging.write_message(&ProtocolMessage::NoOperation));
        assert_eq!(staging.fetch().len(), 1);
        assert!(staging.is_closed());
    }

    #[test]
    fn test_concurrent_producers_do_not_interleave() {
        let staging = std::sync::Arc::new(OutputStaging::new());
        let handles: Vec<_> = (1..=4i64)
            .map(|id| {
                let staging = staging.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        staging.write_message(&ProtocolMessage::DialogFrame {
                            finish: false,
                            cont: false,
                            dialog_id: id,
                            payload: Bytes::from(vec![id as u8; 300]),
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut wire = concat(staging.fetch());
        let decoder = MessageDecoder::default();
        let mut count = 0;
        while let Some(msg) = decoder.decode(&mut wire).unwrap() {
            match msg {
                ProtocolMessage::DialogFrame {
                    dialog_id, payload, ..
                } => assert!(payload.iter().all(|b| *b as i64 == dialog_id)),
                other => panic!("unexpected {:?}", other),
            }
            count += 1;
        }
        assert_eq!(count, 400);
    }
}

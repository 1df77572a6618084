//! Dialog message buffers.

use bytes::{Bytes, BytesMut};

/// Outbound message assembled by the application
#[derive(Debug, Clone, Default)]
pub struct MessageOutput {
    parts: Vec<Bytes>,
    len: usize,
}

impl MessageOutput {
    /// Empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes without copying them
    pub fn write(&mut self, bytes: impl Into<Bytes>) -> &mut Self {
        let bytes = bytes.into();
        if !bytes.is_empty() {
            self.len += bytes.len();
            self.parts.push(bytes);
        }
        self
    }

    /// Append a copy of `slice`
    pub fn write_slice(&mut self, slice: &[u8]) -> &mut Self {
        self.write(Bytes::copy_from_slice(slice))
    }

    /// Total length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Split into frames of at most `max_frame` bytes; always at least one
    pub(crate) fn into_frames(self, max_frame: usize) -> Vec<Bytes> {
        let max_frame = max_frame.max(1);
        if self.len == 0 {
            return vec![Bytes::new()];
        }

        let mut frames = Vec::with_capacity(self.len / max_frame + 1);
        let mut current = BytesMut::new();
        let last = self.parts.len() - 1;
        for (i, mut part) in self.parts.into_iter().enumerate() {
            while !part.is_empty() {
                if current.is_empty() && (part.len() >= max_frame || i == last) {
                    let take = part.len().min(max_frame);
                    frames.push(part.split_to(take));
                    continue;
                }
                let take = (max_frame - current.len()).min(part.len());
                current.extend_from_slice(&part.split_to(take));
                if current.len() == max_frame {
                    frames.push(current.split().freeze());
                }
            }
        }
        if !current.is_empty() {
            frames.push(current.freeze());
        }
        frames
    }
}

impl From<Bytes> for MessageOutput {
    fn from(bytes: Bytes) -> Self {
        let mut out = Self::new();
        out.write(bytes);
        out
    }
}

impl From<Vec<u8>> for MessageOutput {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for MessageOutput {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

impl From<&'static str> for MessageOutput {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

/// Inbound message reassembled from frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageInput {
    frames: Vec<Bytes>,
    len: usize,
}

impl MessageInput {
    pub(crate) fn push(&mut self, frame: Bytes) {
        self.len += frame.len();
        if !frame.is_empty() {
            self.frames.push(frame);
        }
    }

    /// Total length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Non-empty frames in arrival order
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Contiguous bytes; zero-copy for single-frame messages
    pub fn into_bytes(mut self) -> Bytes {
        match self.frames.len() {
            0 => Bytes::new(),
            1 => self.frames.remove(0),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len);
                for frame in &self.frames {
                    buf.extend_from_slice(frame);
                }
                buf.freeze()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_message_yields_one_frame() {
        let frames = MessageOutput::new().into_frames(16);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_split_across_frames() {
        let mut out = MessageOutput::new();
        out.write_slice(b"0123456789");
        out.write(Bytes::from_static(b"abcdef"));
        assert_eq!(out.len(), 16);

        let frames = out.into_frames(6);
        let sizes: Vec<usize> = frames.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![6, 6, 4]);
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        assert_eq!(joined, b"0123456789abcdef");
    }

    #[test]
    fn test_small_parts_coalesce() {
        let mut out = MessageOutput::new();
        out.write_slice(b"ab").write_slice(b"cd").write_slice(b"ef");
        let frames = out.into_frames(64);
        assert_eq!(frames, vec![Bytes::from_static(b"abcdef")]);
    }

    #[test]
    fn test_single_part_is_not_copied() {
        let payload = Bytes::from(vec![7u8; 10]);
        let ptr = payload.as_ptr();
        let frames = MessageOutput::from(payload).into_frames(64);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ptr(), ptr);
    }

    #[test]
    fn test_input_reassembly() {
        let mut input = MessageInput::default();
        input.push(Bytes::from_static(b"hello "));
        input.push(Bytes::new());
        input.push(Bytes::from_static(b"world"));
        assert_eq!(input.len(), 11);
        assert_eq!(input.frames().len(), 2);
        assert_eq!(input.into_bytes(), Bytes::from_static(b"hello world"));
    }
}

//! NUL-delimited frame codec.
//!
//! One codec per connection. Bytes go in one at a time (or a chunk at a time);
//! every time the terminator byte is seen, the bytes accumulated since the last
//! terminator come out as one raw frame string. Nothing here looks at the
//! frame contents, so the codec is transparent to everything except NUL.

use bytes::{BufMut, Bytes, BytesMut};

use crate::Frame;

/// Byte that terminates every frame on the wire.
pub const FRAME_TERMINATOR: u8 = b'\0';

/// Initial capacity of the accumulation buffer. It grows without bound.
const INITIAL_CAPACITY: usize = 1024;

/// Stateful byte-stream-to-frame transcoder.
#[derive(Debug)]
pub struct FrameCodec {
    pending: BytesMut,
}

impl FrameCodec {
    /// Create a codec with an empty accumulation buffer.
    pub fn new() -> Self {
        Self { pending: BytesMut::with_capacity(INITIAL_CAPACITY) }
    }

    /// Feed one byte.
    ///
    /// Returns the completed raw frame (without its terminator) when `byte`
    /// is the terminator, `None` otherwise. Invalid UTF-8 is replaced rather
    /// than rejected.
    pub fn decode_next_byte(&mut self, byte: u8) -> Option<String> {
        if byte == FRAME_TERMINATOR {
            let raw = self.pending.split();
            return Some(String::from_utf8_lossy(&raw).into_owned());
        }

        self.pending.put_u8(byte);
        None
    }

    /// Feed a chunk of bytes, returning every frame completed by it in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(end) = rest.iter().position(|b| *b == FRAME_TERMINATOR) {
            self.pending.extend_from_slice(&rest[..end]);
            let raw = self.pending.split();
            frames.push(String::from_utf8_lossy(&raw).into_owned());
            rest = &rest[end + 1..];
        }

        self.pending.extend_from_slice(rest);
        frames
    }

    /// Number of bytes buffered towards the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Encode raw frame text for the wire, appending the terminator if the
    /// text does not already end with one.
    pub fn encode(message: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(message.len() + 1);
        out.extend_from_slice(message.as_bytes());

        if !message.as_bytes().ends_with(&[FRAME_TERMINATOR]) {
            out.put_u8(FRAME_TERMINATOR);
        }

        out.freeze()
    }

    /// Render and encode a frame.
    pub fn encode_frame(frame: &Frame) -> Bytes {
        Self::encode(&frame.render())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

//! Stream buffering for the link
//!
//! The input side is a plain byte queue: decoded payload is appended as
//! transfers complete and callers consume it from the front.
//!
//! The output side holds already-framed bytes. It also remembers where each
//! frame ends, because a physical transfer must only ever carry whole frames:
//! the receiver decodes every transfer on its own and treats a frame that runs
//! past the end of a transfer as a protocol violation.

use bytes::{Buf, BytesMut};
use protocol::{FrameKind, encode_frame, encoded_len};
use std::collections::VecDeque;

/// Ordered byte queue with append and consume-from-front
#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: BytesMut,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the back
    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Borrow up to `n` bytes from the front without consuming them
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.data[..n.min(self.data.len())]
    }

    /// Drop up to `n` bytes from the front, returning how many were dropped
    pub fn pop(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        self.data.advance(n);
        n
    }

    /// Move as many bytes as fit into `dst`, returning how many were moved
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        n
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keep only the first `n` bytes
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Output queue of encoded frames
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: StreamBuffer,
    /// Encoded length of every queued frame, front first
    frames: VecDeque<usize>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame `payload` and queue it
    ///
    /// The caller bounds `payload` so the frame fits one transfer. Nothing is
    /// queued when the codec refuses the payload.
    pub fn push_frame(&mut self, kind: FrameKind, payload: &[u8]) -> protocol::Result<()> {
        encode_frame(kind, payload, &mut self.bytes.data)?;
        self.frames.push_back(encoded_len(payload.len()));
        Ok(())
    }

    /// Length of the longest run of whole frames at the front that fits in
    /// `capacity` bytes
    pub fn next_chunk_len(&self, capacity: usize) -> usize {
        let mut total = 0;
        for &frame in &self.frames {
            if total + frame > capacity {
                break;
            }
            total += frame;
        }
        total
    }

    /// Borrow up to `n` bytes from the front
    pub fn peek(&self, n: usize) -> &[u8] {
        self.bytes.peek(n)
    }

    /// Drop `n` acknowledged bytes from the front
    ///
    /// Returns false and leaves the queue untouched when `n` does not end on a
    /// frame boundary.
    pub fn consume(&mut self, n: usize) -> bool {
        let mut remaining = n;
        let mut whole = 0;
        for &frame in &self.frames {
            if remaining == 0 || frame > remaining {
                break;
            }
            remaining -= frame;
            whole += 1;
        }
        if remaining != 0 {
            return false;
        }

        self.frames.drain(..whole);
        self.bytes.pop(n);
        true
    }

    /// Drop every queued frame that does not lie entirely within the first
    /// `keep` bytes
    pub fn retain_front(&mut self, keep: usize) {
        let mut total = 0;
        let mut whole = 0;
        for &frame in &self.frames {
            if total + frame > keep {
                break;
            }
            total += frame;
            whole += 1;
        }
        self.frames.truncate(whole);
        self.bytes.truncate(total);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.frames.clear();
    }
}

//! Writer-side process queue
//!
//! The engine pulls outbound bytes from a [`ProcessQueue`] in packet-sized
//! chunks while filling the send window. The queue answers each pull with
//! exactly the requested amount, a final short chunk, or nothing.

use bytes::{Bytes, BytesMut};

/// Result of one pull from the process queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Fill {
    /// Exactly the requested number of bytes.
    Filled(Bytes),

    /// Fewer bytes than requested; the writer is exhausted for now.
    Partial(Bytes),

    /// No data waiting at all.
    Zero,
}

/// Source of outbound application bytes.
pub trait ProcessQueue {
    /// Pull up to `n` bytes. The returned chunk length never exceeds `n`.
    fn fill(&mut self, n: usize) -> Fill;
}

/// In-memory byte queue fed by the writer half of a stream.
#[derive(Debug, Default)]
pub struct ByteQueue {
    buf: BytesMut,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from the writer.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl ProcessQueue for ByteQueue {
    fn fill(&mut self, n: usize) -> Fill {
        if self.buf.is_empty() || n == 0 {
            return Fill::Zero;
        }
        if self.buf.len() >= n {
            Fill::Filled(self.buf.split_to(n).freeze())
        } else {
            Fill::Partial(self.buf.split().freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_exact_then_partial_then_zero() {
        let mut queue = ByteQueue::new();
        queue.push(b"abcdefgh");

        assert_eq!(queue.fill(5), Fill::Filled(Bytes::from_static(b"abcde")));
        assert_eq!(queue.fill(5), Fill::Partial(Bytes::from_static(b"fgh")));
        assert_eq!(queue.fill(5), Fill::Zero);
    }

    #[test]
    fn test_fill_boundary() {
        let mut queue = ByteQueue::new();
        queue.push(b"abc");
        // exactly the queued amount counts as a full chunk
        assert_eq!(queue.fill(3), Fill::Filled(Bytes::from_static(b"abc")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_request() {
        let mut queue = ByteQueue::new();
        queue.push(b"abc");
        assert_eq!(queue.fill(0), Fill::Zero);
        assert_eq!(queue.len(), 3);
    }
}

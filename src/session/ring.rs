//! Bounded buffer of recent terminal output.
//!
//! Reads are mark-based and never consume anything, so asking twice for
//! the output after the same mark gives the same answer.

use std::collections::VecDeque;

/// Position in the output stream, counted in bytes since the session began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mark(u64);

/// Fixed-capacity trailing output buffer.
#[derive(Debug)]
pub struct RingBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    written: u64,
}

impl RingBuffer {
    /// Buffer keeping the last `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            written: 0,
        }
    }

    /// Append output, dropping the oldest bytes beyond capacity.
    pub fn push(&mut self, data: &str) {
        let data = data.as_bytes();
        self.written += data.len() as u64;
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(data);
    }

    /// Current end of the stream.
    pub fn mark(&self) -> Mark {
        Mark(self.written)
    }

    /// Output written after `mark` that is still buffered.
    pub fn since(&self, mark: Mark) -> String {
        let start = self.written - self.bytes.len() as u64;
        let skip = mark.0.saturating_sub(start).min(self.bytes.len() as u64) as usize;
        let (a, b) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(self.bytes.len() - skip);
        if skip < a.len() {
            out.extend_from_slice(&a[skip..]);
            out.extend_from_slice(b);
        } else {
            out.extend_from_slice(&b[skip - a.len()..]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Everything buffered.
    pub fn contents(&self) -> String {
        self.since(Mark(0))
    }

    /// Bytes buffered.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

use std::{
    cmp::Ordering,
    collections::{binary_heap::PeekMut, BinaryHeap},
};

use bytes::{Buf, Bytes};

/// Assembles out-of-order stream frames into an ordered byte stream
///
/// Frames are held in a min-offset heap and trimmed against the read cursor
/// as they are consumed, so no byte is ever delivered twice.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    data: BinaryHeap<Buffer>,
    /// Length of the contiguous prefix already consumed by the application
    bytes_read: u64,
    /// Total number of buffered bytes, including duplicates
    buffered: usize,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, mut offset: u64, mut bytes: Bytes) {
        if offset < self.bytes_read {
            if (offset + bytes.len() as u64) <= self.bytes_read {
                // Wholly stale
                return;
            }
            let diff = self.bytes_read - offset;
            offset += diff;
            bytes.advance(diff as usize);
        }
        if bytes.is_empty() {
            return;
        }
        self.buffered += bytes.len();
        self.data.push(Buffer { offset, bytes });
    }

    /// Pop the next contiguous chunk, at most `max_length` bytes
    pub(crate) fn read(&mut self, max_length: usize) -> Option<Chunk> {
        loop {
            let mut chunk = self.data.peek_mut()?;

            if chunk.offset > self.bytes_read {
                // Gap before the next chunk
                return None;
            }
            if (chunk.offset + chunk.bytes.len() as u64) <= self.bytes_read {
                // Wholly consumed by overlapping predecessors
                self.buffered -= chunk.bytes.len();
                PeekMut::pop(chunk);
                continue;
            }

            // Trim the already-consumed prefix
            let start = (self.bytes_read - chunk.offset) as usize;
            if start > 0 {
                chunk.bytes.advance(start);
                chunk.offset += start as u64;
                self.buffered -= start;
            }

            return Some(if max_length < chunk.bytes.len() {
                self.bytes_read += max_length as u64;
                let offset = chunk.offset;
                chunk.offset += max_length as u64;
                self.buffered -= max_length;
                Chunk::new(offset, chunk.bytes.split_to(max_length))
            } else {
                self.bytes_read += chunk.bytes.len() as u64;
                self.buffered -= chunk.bytes.len();
                let chunk = PeekMut::pop(chunk);
                Chunk::new(chunk.offset, chunk.bytes)
            });
        }
    }

    /// Number of bytes consumed by the application
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether a read would yield data right now
    pub(crate) fn has_readable(&self) -> bool {
        self.data.iter().any(|chunk| {
            chunk.offset <= self.bytes_read
                && chunk.offset + chunk.bytes.len() as u64 > self.bytes_read
        })
    }

    /// Discard all buffered data, e.g. when the stream is reset or stopped
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.buffered = 0;
    }

    /// Account for data that will never be read (stopped streams still owe
    /// flow control credit for it)
    pub(crate) fn skip_to(&mut self, offset: u64) {
        self.bytes_read = self.bytes_read.max(offset);
    }
}

/// A chunk of data from the receive stream
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Chunk {
    /// The offset in the stream
    pub(crate) offset: u64,
    /// The contents of the chunk
    pub(crate) bytes: Bytes,
}

impl Chunk {
    fn new(offset: u64, bytes: Bytes) -> Self {
        Self { offset, bytes }
    }
}

#[derive(Debug, Eq)]
struct Buffer {
    offset: u64,
    bytes: Bytes,
}

impl Ord for Buffer {
    // Min-heap on offset; longer chunks first at equal offsets so overlap
    // trimming discards the shorter one
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .reverse()
            .then(self.bytes.len().cmp(&other.bytes.len()))
    }
}

impl PartialOrd for Buffer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.bytes.len()) == (other.offset, other.bytes.len())
    }
}

use std::{collections::VecDeque, ops::Range};

use bytes::{Buf, Bytes};

use crate::range_set::RangeSet;

/// Buffer of outgoing retransmittable stream data
///
/// Data is retained until acknowledged; ranges deemed lost re-enter the
/// transmit queue under their original offsets.
#[derive(Default, Debug)]
pub(crate) struct SendBuffer {
    /// Data queued by the application but not yet acknowledged
    unacked_segments: VecDeque<Bytes>,
    /// Total size of `unacked_segments`
    unacked_len: usize,
    /// The first offset not yet written by the application
    offset: u64,
    /// The first offset not yet transmitted; always within the unacked data
    unsent: u64,
    /// Acknowledged ranges that cannot be discarded yet because earlier data
    /// remains unacknowledged
    acks: RangeSet,
    /// Previously transmitted ranges deemed lost
    retransmits: RangeSet,
}

impl SendBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(crate) fn write(&mut self, data: Bytes) {
        self.unacked_len += data.len();
        self.offset += data.len() as u64;
        self.unacked_segments.push_back(data);
    }

    /// Discard a range of acknowledged stream data
    pub(crate) fn ack(&mut self, mut range: Range<u64>) {
        // Clamp to data still tracked
        let base_offset = self.offset - self.unacked_len as u64;
        range.start = base_offset.max(range.start);
        range.end = base_offset.max(range.end);
        self.acks.insert(range.clone());

        while self.acks.min() == Some(self.offset - self.unacked_len as u64) {
            let prefix = self.acks.pop_min().unwrap();
            let mut to_advance = (prefix.end - prefix.start) as usize;

            self.unacked_len -= to_advance;
            while to_advance > 0 {
                let front = self
                    .unacked_segments
                    .front_mut()
                    .expect("un-acked data missing from buffer");
                if front.len() <= to_advance {
                    to_advance -= front.len();
                    self.unacked_segments.pop_front();
                } else {
                    front.advance(to_advance);
                    to_advance = 0;
                }
            }
        }
        // An acknowledged range cannot be lost
        self.retransmits.remove(range);
    }

    /// Next range to transmit, preferring lost data, and account for its
    /// transmission
    ///
    /// `max_len` bounds the data bytes only; framing overhead is the
    /// caller's concern.
    pub(crate) fn poll_transmit(&mut self, max_len: usize) -> Range<u64> {
        if let Some(range) = self.retransmits.pop_min() {
            let end = range.end.min((max_len as u64).saturating_add(range.start));
            if end != range.end {
                self.retransmits.insert(end..range.end);
            }
            return range.start..end;
        }

        let end = self.offset.min((max_len as u64).saturating_add(self.unsent));
        let result = self.unsent..end;
        self.unsent = end;
        result
    }

    /// Data for a previously transmitted range
    ///
    /// May return a subset if the range spans segments; call again with the
    /// remainder's start offset for more.
    pub(crate) fn get(&self, offsets: Range<u64>) -> &[u8] {
        let base_offset = self.offset - self.unacked_len as u64;

        let mut segment_offset = base_offset;
        for segment in self.unacked_segments.iter() {
            if offsets.start >= segment_offset
                && offsets.start < segment_offset + segment.len() as u64
            {
                let start = (offsets.start - segment_offset) as usize;
                let end = (offsets.end - segment_offset) as usize;
                return &segment[start..end.min(segment.len())];
            }
            segment_offset += segment.len() as u64;
        }
        &[]
    }

    /// Queue a sent but unacknowledged range for retransmission
    pub(crate) fn retransmit(&mut self, range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        self.retransmits.insert(range);
    }

    /// The offset the next write will begin at
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether all sent data has been acknowledged
    pub(crate) fn is_fully_acked(&self) -> bool {
        self.unacked_len == 0
    }

    pub(crate) fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset || !self.retransmits.is_empty()
    }

    /// Whether the next range `poll_transmit` yields is a retransmission,
    /// which is exempt from flow control by virtue of its original offsets
    pub(crate) fn next_is_retransmit(&self) -> bool {
        !self.retransmits.is_empty()
    }

    /// Bytes currently buffered awaiting acknowledgement
    pub(crate) fn buffered(&self) -> usize {
        self.unacked_len
    }
}

use std::{
    cmp,
    collections::{BTreeMap, VecDeque},
    mem,
    ops::{Index, IndexMut},
    time::Instant,
};

use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;

use crate::{
    assembler::Assembler,
    frame,
    range_set::RangeSet,
    EncryptionLevel, StreamId,
};

/// Per-encryption-level packet bookkeeping
///
/// Each level tracks its own received and in-flight packets, but packet
/// numbers come from one connection-wide sequence: the wire header does not
/// name a level, so only globally unique numbers keep acknowledgements
/// unambiguous.
pub(crate) struct PacketSpace {
    pub(crate) dedup: Dedup,

    /// Handshake-stream data to (re)send at this level
    pub(crate) pending_crypto: VecDeque<frame::Crypto>,
    /// Packet numbers to acknowledge
    pub(crate) pending_acks: PendingAcks,

    /// The largest packet of this space the peer has acknowledged
    pub(crate) largest_acked_packet: Option<u64>,
    /// Transmitted but not acknowledged
    // A BTreeMap so ACK ranges and loss scans can query by range
    pub(crate) sent_packets: BTreeMap<u64, SentPacket>,

    /// Incoming handshake-stream reassembly
    pub(crate) crypto_stream: Assembler,
    /// Offset of the next outgoing handshake-stream byte
    pub(crate) crypto_offset: u64,

    /// When the earliest sent packet will be deemed lost by time threshold
    pub(crate) loss_time: Option<Instant>,
    pub(crate) ping_pending: bool,
}

impl PacketSpace {
    pub(crate) fn new() -> Self {
        Self {
            dedup: Dedup::new(),
            pending_crypto: VecDeque::new(),
            pending_acks: PendingAcks::default(),
            largest_acked_packet: None,
            sent_packets: BTreeMap::new(),
            crypto_stream: Assembler::new(),
            crypto_offset: 0,
            loss_time: None,
            ping_pending: false,
        }
    }

    /// Queue handshake-stream bytes for transmission at this level
    pub(crate) fn queue_crypto(&mut self, data: bytes::Bytes) {
        let offset = self.crypto_offset;
        self.crypto_offset += data.len() as u64;
        self.pending_crypto.push_back(frame::Crypto { offset, data });
    }
}

impl Index<EncryptionLevel> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, level: EncryptionLevel) -> &PacketSpace {
        &self.as_ref()[level as usize]
    }
}

impl IndexMut<EncryptionLevel> for [PacketSpace; 3] {
    fn index_mut(&mut self, level: EncryptionLevel) -> &mut PacketSpace {
        &mut self.as_mut()[level as usize]
    }
}

/// A packet in flight, retained until acknowledged or declared lost
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub(crate) time_sent: Instant,
    /// Size including framing overhead; zero if the packet does not count
    /// toward congestion control
    pub(crate) size: u16,
    /// Whether an acknowledgement is expected directly in response
    pub(crate) ack_eliciting: bool,
    /// Whether loss of this packet must trigger a handshake retransmission
    pub(crate) is_crypto_packet: bool,
    /// ACK ranges this packet carried, so their delivery can stop us from
    /// re-acknowledging
    pub(crate) acks: RangeSet,
    /// Frames to retransmit if the packet is lost
    pub(crate) retransmits: Retransmits,
    /// Stream data ranges this packet carried
    pub(crate) stream_frames: frame::StreamMetaVec,
}

/// Retransmittable frame state queued for transmission
#[derive(Debug, Default, Clone)]
pub(crate) struct Retransmits {
    pub(crate) max_data: bool,
    pub(crate) max_stream_data: FxHashSet<StreamId>,
    pub(crate) rst_stream: Vec<(StreamId, u64, u64)>,
    pub(crate) stop_sending: Vec<(StreamId, u64)>,
    pub(crate) crypto: VecDeque<frame::Crypto>,
    pub(crate) new_tokens: Vec<bytes::Bytes>,
}

/// Assigns monotonically increasing packet numbers, occasionally skipping
/// one so that a peer acknowledging unseen packets gives itself away
pub(crate) struct PacketNumberGenerator {
    next: u64,
    next_to_skip: u64,
    average_period: u64,
    rng: rand::rngs::StdRng,
}

impl PacketNumberGenerator {
    pub(crate) fn new() -> Self {
        let mut this = Self {
            next: 1,
            next_to_skip: 0,
            average_period: 500,
            rng: rand::rngs::StdRng::from_entropy(),
        };
        this.schedule_skip();
        this
    }

    pub(crate) fn peek(&self) -> u64 {
        self.next
    }

    /// Commit the peeked number
    pub(crate) fn pop(&mut self) -> u64 {
        let x = self.next;
        self.next += 1;
        if self.next == self.next_to_skip {
            self.next += 1;
            self.schedule_skip();
        }
        x
    }

    fn schedule_skip(&mut self) {
        self.next_to_skip = self.next + self.rng.gen_range(1..=2 * self.average_period);
    }
}

/// Tracks which packet numbers need acknowledging and when one is due
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    ranges: RangeSet,
    /// Ack-eliciting packets received since the last ACK went out
    eliciting_since_ack: u32,
    /// Set when a packet arrived out of order, demanding a prompt ACK
    out_of_order: bool,
    /// Set when the delayed-ack timer fired
    timer_fired: bool,
    pub(crate) latest_incoming: Option<Instant>,
}

/// Ack-eliciting packets tolerated before an immediate ACK is due
const PACKETS_BEFORE_ACK: u32 = 2;
/// Keep the ACK frame bounded even under pathological reordering
const MAX_ACK_BLOCKS: usize = 64;

impl PendingAcks {
    /// Record a packet requiring acknowledgement
    pub(crate) fn insert(&mut self, packet: u64, ack_eliciting: bool, now: Instant) {
        let out_of_order = self.ranges.max().map_or(false, |max| packet < max);
        self.ranges.insert_one(packet);
        if self.ranges.len() > MAX_ACK_BLOCKS {
            self.ranges.pop_min();
        }
        if ack_eliciting {
            self.eliciting_since_ack += 1;
            self.latest_incoming = Some(now);
            self.out_of_order |= out_of_order;
        }
    }

    /// Whether an ACK should go out immediately
    pub(crate) fn ack_required(&self) -> bool {
        !self.ranges.is_empty()
            && (self.eliciting_since_ack >= PACKETS_BEFORE_ACK
                || self.out_of_order
                || self.timer_fired)
    }

    /// Whether the delayed-ack timer should be armed
    pub(crate) fn should_delay_ack(&self) -> bool {
        !self.ranges.is_empty() && self.eliciting_since_ack > 0 && !self.ack_required()
    }

    pub(crate) fn on_ack_delay_elapsed(&mut self) {
        if self.eliciting_since_ack > 0 {
            self.timer_fired = true;
        }
    }

    /// Note that an ACK covering the current ranges was just sent
    pub(crate) fn acks_sent(&mut self) {
        self.eliciting_since_ack = 0;
        self.out_of_order = false;
        self.timer_fired = false;
    }

    /// The peer promised never to wait for numbers below `least_unacked`;
    /// stop acknowledging them
    pub(crate) fn ignore_below(&mut self, least_unacked: u64) {
        self.ranges.remove(0..least_unacked);
    }

    /// Drop ranges the peer confirmed it received our ACK for
    pub(crate) fn subtract(&mut self, acked: &RangeSet) {
        self.ranges.subtract(acked);
    }

    pub(crate) fn ranges(&self) -> &RangeSet {
        &self.ranges
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// RFC4303-style sliding window packet number deduplicator
///
/// A contiguous bitfield where each bit corresponds to a packet number and
/// the rightmost bit is always set. Bits left of the window are assumed set.
///
/// ```text
/// ...xxxxxxxxx 1 0
///     ^        ^ ^
/// window highest next
/// ```
pub(crate) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated
    next: u64,
}

/// Inner bitfield type
///
/// Packet numbers are never reused, so this only needs to cover reordering
/// windows seen in practice.
type Window = u128;

/// Number of packets tracked by `Dedup`
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    pub(crate) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number
    ///
    /// Returns whether the packet might be a duplicate.
    pub(crate) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of the window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within the window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                true
            }
        } else {
            // Left of the window
            true
        }
    }
}

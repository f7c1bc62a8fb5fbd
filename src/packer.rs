use std::time::Instant;

use bytes::BufMut;
use tracing::trace;

use crate::{
    crypto::CryptoProvider,
    flow_control::FlowController,
    frame::{self, Ack, ConnectionClose, Frame, StreamMeta, StreamMetaVec},
    packet::{ConnectionId, Header, PacketNumber},
    range_set::RangeSet,
    spaces::{PacketNumberGenerator, PacketSpace, Retransmits},
    streams::Streams,
    version::VersionNumber,
    EncryptionLevel, Side, MAX_PACKET_SIZE,
};

/// Headroom kept free in packets that are not yet forward-secure, so a
/// handshake packet can later be retransmitted with more overhead
const NON_FORWARD_SECURE_PACKET_SIZE_REDUCTION: usize = 50;

/// Assembles one outgoing packet at a time from whatever wants to be sent
///
/// Control frames drain newest-first while they fit; stream data is pulled
/// round-robin, with handshake data taking priority via its own packet mode.
pub(crate) struct PacketPacker {
    side: Side,
    pub(crate) version: VersionNumber,
    pub(crate) dst_cid: ConnectionId,
    /// Negotiated: drop the connection ID from forward-secure headers
    pub(crate) omit_connection_id: bool,
    control: Vec<Frame>,
}

/// Record of a packet the packer produced, for the sent-packet tracker
#[derive(Debug)]
pub(crate) struct PackedPacket {
    pub(crate) number: u64,
    pub(crate) level: EncryptionLevel,
    pub(crate) ack_eliciting: bool,
    pub(crate) is_crypto_packet: bool,
    /// ACK ranges included, so delivery can retire them
    pub(crate) acks: RangeSet,
    /// Control state to requeue if the packet is lost
    pub(crate) retransmits: Retransmits,
    pub(crate) stream_frames: StreamMetaVec,
}

impl PacketPacker {
    pub(crate) fn new(side: Side, version: VersionNumber, dst_cid: ConnectionId) -> Self {
        Self {
            side,
            version,
            dst_cid,
            omit_connection_id: false,
            control: Vec::new(),
        }
    }

    /// Queue a control frame for the next packet with room
    pub(crate) fn queue_control(&mut self, frame: Frame) {
        self.control.push(frame);
    }

    pub(crate) fn has_control(&self) -> bool {
        !self.control.is_empty()
    }

    /// Discard queued control frames; used when the connection closes and
    /// they are of no further use
    pub(crate) fn clear_control(&mut self) {
        self.control.clear();
    }

    /// Whether STREAM frames may be sent at `level`
    ///
    /// Clients may send once initial secrecy is established; servers only
    /// once the connection is forward-secure.
    pub(crate) fn can_send_data(&self, level: EncryptionLevel) -> bool {
        if self.side.is_client() {
            level >= EncryptionLevel::Secure
        } else {
            level == EncryptionLevel::ForwardSecure
        }
    }

    /// Assemble, seal, and append one packet to `buf`
    ///
    /// Returns `None` when nothing needs sending. `close` overrides all
    /// other content with a single CONNECTION_CLOSE. With `permit_data`
    /// false (congestion-blocked), only handshake data and acknowledgements
    /// may go out.
    pub(crate) fn pack(
        &mut self,
        now: Instant,
        crypto: &dyn CryptoProvider,
        pn_gen: &mut PacketNumberGenerator,
        spaces: &mut [PacketSpace; 3],
        streams: &mut Streams,
        conn_flow: &mut FlowController,
        close: Option<&ConnectionClose>,
        permit_data: bool,
        buf: &mut Vec<u8>,
    ) -> Option<PackedPacket> {
        let current = crypto.current_level();
        let crypto_level =
            EncryptionLevel::iter().find(|&l| !spaces[l].pending_crypto.is_empty());

        let level = if close.is_some() {
            current
        } else if let Some(level) = crypto_level {
            level
        } else if permit_data
            && (self.has_control()
                || spaces[current].ping_pending
                || (self.can_send_data(current) && streams.has_pending()))
        {
            current
        } else if let Some(level) =
            EncryptionLevel::iter().find(|&l| spaces[l].pending_acks.ack_required())
        {
            level
        } else {
            return None;
        };
        let is_crypto_packet = close.is_none() && crypto_level == Some(level);

        // Header
        let number = pn_gen.peek();
        // Lowest packet still awaiting acknowledgement in any space, which
        // bounds how far back the peer must be able to reconstruct numbers
        let least_unacked = EncryptionLevel::iter()
            .filter_map(|l| spaces[l].sent_packets.keys().next().copied())
            .min()
            .unwrap_or(number);
        let header = Header::Public {
            dst_cid: if self.omit_connection_id && level == EncryptionLevel::ForwardSecure {
                None
            } else {
                Some(self.dst_cid)
            },
            version: (self.side.is_client() && level != EncryptionLevel::ForwardSecure)
                .then_some(self.version),
            nonce: if self.side.is_server() && level == EncryptionLevel::Secure {
                crypto.diversification_nonce()
            } else {
                None
            },
            number: PacketNumber::for_header(number, least_unacked),
        };
        let header_start = buf.len();
        header.encode(buf);
        let header_len = buf.len() - header_start;

        let mut budget = MAX_PACKET_SIZE
            .checked_sub(header_len + crypto.tag_len(level))
            .expect("header alone exceeds the packet size");
        if is_crypto_packet && level != EncryptionLevel::ForwardSecure {
            budget -= NON_FORWARD_SECURE_PACKET_SIZE_REDUCTION;
        }

        let mut payload = Vec::with_capacity(budget);
        let mut packed = PackedPacket {
            number,
            level,
            ack_eliciting: false,
            is_crypto_packet,
            acks: RangeSet::new(),
            retransmits: Retransmits::default(),
            stream_frames: StreamMetaVec::default(),
        };

        let has_unacked = EncryptionLevel::iter().any(|l| !spaces[l].sent_packets.is_empty());
        if let Some(close) = close {
            close.encode(&mut payload, budget);
        } else {
            self.append_acks(
                now,
                number,
                least_unacked,
                has_unacked,
                &mut spaces[level],
                budget,
                &mut payload,
                &mut packed,
            );

            if is_crypto_packet {
                self.append_crypto(&mut spaces[level], budget, &mut payload, &mut packed);
            } else if permit_data {
                if std::mem::take(&mut spaces[level].ping_pending) {
                    Frame::Ping.encode(number, &mut payload);
                    packed.ack_eliciting = true;
                }
                self.append_control(number, budget, &mut payload, &mut packed);
                if self.can_send_data(level) {
                    self.append_stream_frames(streams, conn_flow, budget, &mut payload, &mut packed);
                }
                // BLOCKED frames generated while packing ride in the next packet
                for frame in streams.take_blocked() {
                    self.control.push(frame);
                }
            }
        }

        if payload.is_empty() {
            buf.truncate(header_start);
            return None;
        }
        assert!(payload.len() <= budget, "packed payload exceeds the budget");

        let sealed = crypto.seal(level, number, &buf[header_start..], &payload);
        buf.extend_from_slice(&sealed);
        assert!(
            buf.len() - header_start <= MAX_PACKET_SIZE,
            "packed packet exceeds the maximum packet size"
        );

        let popped = pn_gen.pop();
        debug_assert_eq!(popped, number, "peeked and popped packet numbers diverged");
        trace!(
            number,
            %level,
            len = buf.len() - header_start,
            ack_eliciting = packed.ack_eliciting,
            "packed"
        );
        Some(packed)
    }

    /// ACK plus STOP_WAITING, included whenever this space has something to
    /// acknowledge or the connection has unacknowledged history to bound
    fn append_acks(
        &mut self,
        now: Instant,
        number: u64,
        least_unacked: u64,
        has_unacked: bool,
        space: &mut PacketSpace,
        budget: usize,
        payload: &mut Vec<u8>,
        packed: &mut PackedPacket,
    ) {
        if !space.pending_acks.is_empty() {
            let delay = space
                .pending_acks
                .latest_incoming
                .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64);
            let mut ack = Vec::new();
            Ack::encode(delay, space.pending_acks.ranges(), &mut ack);
            if payload.len() + ack.len() <= budget {
                payload.extend_from_slice(&ack);
                packed.acks = space.pending_acks.ranges().clone();
                space.pending_acks.acks_sent();
            }
        }
        if !packed.acks.is_empty() || has_unacked {
            let frame = Frame::StopWaiting { least_unacked };
            if payload.len() + frame.size() <= budget {
                frame.encode(number, payload);
            }
        }
    }

    fn append_crypto(
        &mut self,
        space: &mut PacketSpace,
        budget: usize,
        payload: &mut Vec<u8>,
        packed: &mut PackedPacket,
    ) {
        while let Some(mut frame) = space.pending_crypto.pop_front() {
            let avail = budget - payload.len();
            if avail <= frame::Crypto::SIZE_BOUND {
                space.pending_crypto.push_front(frame);
                break;
            }
            let data_budget = avail - frame::Crypto::SIZE_BOUND;
            if frame.data.len() > data_budget {
                let rest = frame.data.split_off(data_budget);
                space.pending_crypto.push_front(frame::Crypto {
                    offset: frame.offset + data_budget as u64,
                    data: rest,
                });
            }
            frame.encode(payload);
            packed.retransmits.crypto.push_back(frame);
            packed.ack_eliciting = true;
        }
    }

    fn append_control(
        &mut self,
        number: u64,
        budget: usize,
        payload: &mut Vec<u8>,
        packed: &mut PackedPacket,
    ) {
        while let Some(frame) = self.control.last() {
            if payload.len() + frame.size() > budget {
                break;
            }
            let frame = self.control.pop().unwrap();
            frame.encode(number, payload);
            packed.ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::MaxData(_) => packed.retransmits.max_data = true,
                Frame::MaxStreamData { id, .. } => {
                    packed.retransmits.max_stream_data.insert(id);
                }
                Frame::RstStream(x) => {
                    packed
                        .retransmits
                        .rst_stream
                        .push((x.id, x.error_code, x.final_offset));
                }
                Frame::StopSending { id, error_code } => {
                    packed.retransmits.stop_sending.push((id, error_code));
                }
                Frame::NewToken { token } => packed.retransmits.new_tokens.push(token),
                // PING, BLOCKED, and STREAM_BLOCKED are moment-in-time
                // signals; they are not retransmitted when lost
                _ => {}
            }
        }
    }

    fn append_stream_frames(
        &mut self,
        streams: &mut Streams,
        conn_flow: &mut FlowController,
        budget: usize,
        payload: &mut Vec<u8>,
        packed: &mut PackedPacket,
    ) {
        let mut frames: Vec<(StreamMeta, bytes::Bytes)> = Vec::new();
        let mut used = payload.len();
        loop {
            let avail = budget - used;
            if avail <= StreamMeta::SIZE_BOUND {
                break;
            }
            match streams.next_stream_frame(avail - StreamMeta::SIZE_BOUND, conn_flow) {
                Some((meta, data)) => {
                    used += StreamMeta::SIZE_BOUND + data.len();
                    frames.push((meta, data));
                }
                None => break,
            }
        }
        let last = frames.len().saturating_sub(1);
        for (i, (meta, data)) in frames.into_iter().enumerate() {
            // The final frame is bounded by the packet itself, saving the
            // length bytes
            meta.encode(i != last, payload);
            payload.put_slice(&data);
            packed.stream_frames.push(meta);
            packed.ack_eliciting = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{CryptoConfig, NullCryptoConfig, SessionOpts},
        streams::StreamsConfig,
        transport_parameters::TransportParameters,
    };
    use std::net::{Ipv6Addr, SocketAddr};

    fn provider(side: Side) -> Box<dyn CryptoProvider> {
        NullCryptoConfig.start_session(
            side,
            SessionOpts {
                server_name: None,
                params: TransportParameters::default(),
                remote: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433),
                version: VersionNumber(36),
                token_key: None,
                accept_cookie: None,
            },
        )
    }

    fn fixtures() -> (PacketNumberGenerator, [PacketSpace; 3], Streams, FlowController, PacketPacker) {
        let pn_gen = PacketNumberGenerator::new();
        let spaces = [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()];
        let streams = Streams::new(
            Side::Client,
            StreamsConfig {
                max_incoming: 100,
                stream_receive_window: 1 << 16,
                max_stream_receive_window: 1 << 20,
                initial_send_window: 1 << 16,
                send_buffer_size: 1 << 20,
            },
        );
        let conn_flow = FlowController::new(1 << 20, 1 << 24, 1 << 20, false);
        let packer = PacketPacker::new(
            Side::Client,
            VersionNumber(36),
            ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
        );
        (pn_gen, spaces, streams, conn_flow, packer)
    }

    #[test]
    fn nothing_to_send() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let crypto = provider(Side::Client);
        let mut buf = Vec::new();
        assert!(packer
            .pack(Instant::now(), &*crypto, &mut pn_gen, &mut spaces, &mut streams, &mut flow, None, true, &mut buf)
            .is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn crypto_data_packs_at_its_level() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let crypto = provider(Side::Client);
        spaces[EncryptionLevel::Unencrypted]
            .queue_crypto(bytes::Bytes::from_static(b"hello handshake"));
        let mut buf = Vec::new();
        let packed = packer
            .pack(Instant::now(), &*crypto, &mut pn_gen, &mut spaces, &mut streams, &mut flow, None, true, &mut buf)
            .unwrap();
        assert_eq!(packed.level, EncryptionLevel::Unencrypted);
        assert!(packed.is_crypto_packet);
        assert!(packed.ack_eliciting);
        assert_eq!(packed.retransmits.crypto.len(), 1);
        assert!(spaces[EncryptionLevel::Unencrypted].pending_crypto.is_empty());
        assert!(buf.len() <= MAX_PACKET_SIZE);
    }

    #[test]
    fn large_crypto_data_is_split_across_packets() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let crypto = provider(Side::Client);
        let blob = bytes::Bytes::from(vec![0x61; 3000]);
        spaces[EncryptionLevel::Unencrypted].queue_crypto(blob);
        let mut packets = 0;
        let mut total = 0;
        loop {
            let mut buf = Vec::new();
            match packer.pack(
                Instant::now(),
                &*crypto,
                &mut pn_gen,
                &mut spaces,
                &mut streams,
                &mut flow,
                None,
                true,
                &mut buf,
            ) {
                Some(packed) => {
                    packets += 1;
                    total += packed
                        .retransmits
                        .crypto
                        .iter()
                        .map(|c| c.data.len())
                        .sum::<usize>();
                    assert!(buf.len() <= MAX_PACKET_SIZE);
                }
                None => break,
            }
        }
        assert!(packets >= 3);
        assert_eq!(total, 3000);
    }

    #[test]
    fn control_frames_drain_lifo() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let crypto = provider(Side::Client);
        packer.queue_control(Frame::MaxData(100));
        packer.queue_control(Frame::Ping);
        let mut buf = Vec::new();
        let packed = packer
            .pack(Instant::now(), &*crypto, &mut pn_gen, &mut spaces, &mut streams, &mut flow, None, true, &mut buf)
            .unwrap();
        assert!(packed.retransmits.max_data);
        assert!(packed.ack_eliciting);
        assert!(!packer.has_control());
    }

    #[test]
    fn ack_only_packet_is_not_ack_eliciting() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let crypto = provider(Side::Client);
        let now = Instant::now();
        let level = EncryptionLevel::Unencrypted;
        spaces[level].pending_acks.insert(1, true, now);
        spaces[level].pending_acks.insert(2, true, now);
        assert!(spaces[level].pending_acks.ack_required());
        let mut buf = Vec::new();
        let packed = packer
            .pack(now, &*crypto, &mut pn_gen, &mut spaces, &mut streams, &mut flow, None, true, &mut buf)
            .unwrap();
        assert!(!packed.ack_eliciting);
        assert_eq!(packed.acks.iter().collect::<Vec<_>>(), &[1..3]);
        // The urge to acknowledge is spent
        assert!(!spaces[level].pending_acks.ack_required());
    }

    #[test]
    fn close_packet_carries_only_the_close() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let crypto = provider(Side::Client);
        packer.queue_control(Frame::Ping);
        packer.clear_control();
        let close = ConnectionClose {
            error_code: crate::transport_error::Code::NO_ERROR,
            reason: bytes::Bytes::from_static(b"done"),
        };
        let mut buf = Vec::new();
        let packed = packer
            .pack(
                Instant::now(),
                &*crypto,
                &mut pn_gen,
                &mut spaces,
                &mut streams,
                &mut flow,
                Some(&close),
                true,
                &mut buf,
            )
            .unwrap();
        assert!(!packed.ack_eliciting);
        assert!(!buf.is_empty());
    }

    #[test]
    fn version_flag_dropped_when_forward_secure() {
        let (mut pn_gen, mut spaces, mut streams, mut flow, mut packer) = fixtures();
        let mut client = provider(Side::Client);
        let mut server = provider(Side::Server);
        // Drive the handshake so the client session is forward-secure
        let mut to_server = Vec::new();
        for (_, bytes) in client.handshake_tick(&[]).unwrap() {
            to_server.extend(bytes);
        }
        for _ in 0..4 {
            let mut to_client = Vec::new();
            for (_, bytes) in server.handshake_tick(&to_server).unwrap() {
                to_client.extend(bytes);
            }
            to_server.clear();
            for (_, bytes) in client.handshake_tick(&to_client).unwrap() {
                to_server.extend(bytes);
            }
        }
        assert!(client.is_handshake_complete());

        let id = streams.open().unwrap();
        streams.write(id, b"data").unwrap();
        let mut buf = Vec::new();
        let packed = packer
            .pack(Instant::now(), &*client, &mut pn_gen, &mut spaces, &mut streams, &mut flow, None, true, &mut buf)
            .unwrap();
        assert_eq!(packed.level, EncryptionLevel::ForwardSecure);
        assert_eq!(packed.stream_frames.len(), 1);
        // Forward-secure client headers no longer carry the version flag
        assert_eq!(buf[0] & 0x01, 0);
    }
}

use std::{
    cmp,
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    crypto::{CryptoProvider, SessionOpts, TokenKey},
    endpoint::{BufferPool, Config, EndpointEvent, EndpointEventInner, Transmit},
    flow_control::FlowController,
    frame::{self, ConnectionClose, Frame},
    packer::{PackedPacket, PacketPacker},
    packet::ConnectionId,
    spaces::{PacketNumberGenerator, PacketSpace, SentPacket},
    streams::{FinishError, ReadError, Streams, WriteError},
    timer::{Timer, TimerTable},
    transport_error::TransportError,
    transport_parameters::TransportParameters,
    unpacker::{self, UnpackError, Unpacked, UnpackedPacket},
    version::{highest_common_version, VersionNumber},
    EncryptionLevel, Side, StreamId, CRYPTO_STREAM_ID, MAX_PACKET_SIZE, TIMER_GRANULARITY,
};

/// How long to wait for a pending acknowledgement before sending it anyway
const ACK_DELAY: Duration = Duration::from_millis(25);
/// Exponential backoff cap for retransmission timers
const MAX_BACKOFF_EXPONENT: u32 = 8;
/// Loss declared when a packet is this many packet numbers older than an
/// acknowledged one
const PACKET_THRESHOLD: u64 = 3;

/// Protocol state machine for a single connection
///
/// Owns the streams, flow controllers, packet spaces, packer, and crypto
/// session. Performs no I/O: datagrams and timeouts are handed in via
/// [`handle_event`](Self::handle_event) and
/// [`handle_timeout`](Self::handle_timeout), packets to transmit come out of
/// [`poll_transmit`](Self::poll_transmit), and application-facing events out
/// of [`poll`](Self::poll).
pub struct Connection {
    side: Side,
    remote: SocketAddr,
    version: VersionNumber,
    config: Arc<Config>,
    token_key: Option<Arc<TokenKey>>,
    server_name: Option<String>,
    crypto: Box<dyn CryptoProvider>,
    packer: PacketPacker,
    /// One number sequence across all levels; the wire header names no
    /// level, so only globally unique numbers keep acknowledgements
    /// unambiguous
    packet_numbers: PacketNumberGenerator,
    spaces: [PacketSpace; 3],
    streams: Streams,
    /// Connection-level flow control, aggregated over contributing streams
    conn_flow: FlowController,
    local_params: TransportParameters,
    state: State,
    timers: TimerTable,
    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEvent>,
    pool: Arc<BufferPool>,
    rng: StdRng,

    /// Highest packet number received in any space, for truncated-number
    /// expansion before the packet's space is known
    largest_rx_packet: u64,
    /// Set once the server has demonstrably accepted our version
    version_negotiated: bool,
    reported_state: ConnState,
    handshake_done: bool,
    /// Effective idle timeout, min of ours and the peer's
    idle_timeout: Duration,
    /// A CONNECTION_CLOSE still needs to be transmitted
    close_pending: bool,

    //
    // Loss detection
    //
    rtt: RttEstimator,
    /// Consecutive handshake retransmissions without progress
    crypto_count: u32,
    /// Consecutive probe timeouts without progress
    pto_count: u32,
    time_of_last_sent_ack_eliciting_packet: Option<Instant>,
    time_of_last_sent_crypto_packet: Option<Instant>,
    in_flight: InFlight,

    //
    // Congestion control
    //
    congestion_window: u64,
    /// Sent time after which a loss starts a new recovery epoch
    recovery_start_time: Instant,
    /// Slow start below this, congestion avoidance above
    ssthresh: u64,
    lost_packets: u64,
}

impl Connection {
    pub(crate) fn new(
        config: Arc<Config>,
        token_key: Option<Arc<TokenKey>>,
        side: Side,
        version: VersionNumber,
        cid: ConnectionId,
        remote: SocketAddr,
        server_name: Option<String>,
        pool: Arc<BufferPool>,
        now: Instant,
    ) -> Self {
        let local_params = config.transport_parameters(side);
        let crypto = config.crypto.start_session(
            side,
            SessionOpts {
                server_name: server_name.clone(),
                params: local_params.clone(),
                remote,
                version,
                token_key: token_key.clone(),
                accept_cookie: config.accept_cookie.clone(),
            },
        );
        let streams = Streams::new(side, config.streams_config());
        let conn_flow = FlowController::new(
            config.connection_receive_window,
            config.max_connection_receive_window,
            // Assumed until the peer's parameters arrive
            TransportParameters::default().connection_receive_window,
            false,
        );
        let mut this = Self {
            side,
            remote,
            version,
            token_key,
            server_name,
            crypto,
            packer: PacketPacker::new(side, version, cid),
            packet_numbers: PacketNumberGenerator::new(),
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            streams,
            conn_flow,
            local_params,
            state: State::Handshake,
            timers: TimerTable::default(),
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            pool,
            rng: StdRng::from_entropy(),
            largest_rx_packet: 0,
            version_negotiated: side.is_server(),
            reported_state: ConnState::Initial,
            handshake_done: false,
            idle_timeout: config.idle_timeout,
            close_pending: false,
            rtt: RttEstimator::new(),
            crypto_count: 0,
            pto_count: 0,
            time_of_last_sent_ack_eliciting_packet: None,
            time_of_last_sent_crypto_packet: None,
            in_flight: InFlight::new(),
            congestion_window: INITIAL_WINDOW,
            recovery_start_time: now,
            ssthresh: u64::MAX,
            lost_packets: 0,
            config,
        };
        this.timers
            .set(Timer::Handshake, now + this.config.handshake_timeout);
        this.reset_idle_timeout(now);
        this.start_handshake(now);
        this
    }

    /// Kick the crypto session; clients produce their first hello here
    fn start_handshake(&mut self, now: Instant) {
        match self.crypto.handshake_tick(&[]) {
            Ok(out) => {
                for (level, bytes) in out {
                    self.spaces[level].queue_crypto(Bytes::from(bytes));
                }
            }
            Err(e) => self.close_with_error(now, e),
        }
    }

    /// Process an event routed to this connection by its endpoint
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event.0 {
            ConnectionEventInner::Datagram { now, remote, data } => {
                self.handle_datagram(now, remote, data)
            }
        }
    }

    fn handle_datagram(&mut self, now: Instant, remote: SocketAddr, data: BytesMut) {
        if self.state.is_drained() {
            return;
        }
        let unpacked = unpacker::unpack(
            &mut *self.crypto,
            !self.side,
            self.version,
            self.largest_rx_packet,
            data,
        );
        match unpacked {
            Ok(Unpacked::VersionNegotiate(versions)) => {
                self.handle_version_negotiation(now, versions);
            }
            Ok(Unpacked::PublicReset) => {
                debug!("connection reset by peer");
                self.terminate(ConnectionError::Reset);
            }
            Ok(Unpacked::Packet(packet)) => self.handle_packet(now, remote, packet),
            Err(UnpackError::Discard(reason)) => {
                // Commonly garbage, or a reordered packet for keys we don't
                // have yet
                trace!("dropping packet: {reason}");
            }
            Err(UnpackError::Fatal(e)) => self.close_with_error(now, e),
        }
    }

    fn handle_packet(&mut self, now: Instant, remote: SocketAddr, packet: UnpackedPacket) {
        let UnpackedPacket {
            number,
            level,
            plaintext,
        } = packet;

        if self.spaces[level].dedup.insert(number) {
            trace!(number, %level, "discarding duplicate");
            return;
        }
        self.largest_rx_packet = self.largest_rx_packet.max(number);
        // The peer proved it holds this address; track the latest one
        self.remote = remote;
        self.reset_idle_timeout(now);

        if self.state.is_closed() {
            // Late data cannot revive the connection, but remind the peer
            self.close_pending = true;
            return;
        }

        if !self.version_negotiated {
            // Any authenticated packet means the server took our version
            self.version_negotiated = true;
            self.advance_state(ConnState::VersionNegotiated);
        }
        if level == EncryptionLevel::Secure {
            self.advance_state(ConnState::Secure);
        }

        let mut ack_eliciting = false;
        for result in frame::Iter::new(plaintext, number) {
            let frame = match result {
                Ok(x) => x,
                Err(e) => {
                    self.close_with_error(now, e);
                    return;
                }
            };
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(e) = self.process_frame(now, level, frame) {
                self.close_with_error(now, e);
                return;
            }
        }
        if self.state.is_closed() {
            // A CONNECTION_CLOSE in the packet tore the connection down
            return;
        }

        self.spaces[level].pending_acks.insert(number, ack_eliciting, now);
        if self.spaces[level].pending_acks.should_delay_ack()
            && self.timers.get(Timer::AckDelay).is_none()
        {
            self.timers.set(Timer::AckDelay, now + ACK_DELAY);
        }

        self.after_handshake_progress(now);
    }

    fn process_frame(
        &mut self,
        now: Instant,
        level: EncryptionLevel,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_received(now, ack)?,
            Frame::StopWaiting { least_unacked } => {
                // Packet numbers are connection-wide, so the promise spans
                // every space
                for l in EncryptionLevel::iter() {
                    self.spaces[l].pending_acks.ignore_below(least_unacked);
                }
            }
            Frame::Crypto(c) => {
                self.spaces[level].crypto_stream.insert(c.offset, c.data);
                self.drain_crypto_stream(level)?;
            }
            Frame::Stream(s) => {
                if s.id == CRYPTO_STREAM_ID {
                    return Err(TransportError::INVALID_STREAM_ID(
                        "handshake data must use CRYPTO frames",
                    ));
                }
                let before = self.streams.unaccepted_count();
                if let Some(id) = self
                    .streams
                    .received_stream_frame(s, &mut self.conn_flow)?
                {
                    if self.streams.is_readable(id) {
                        self.events.push_back(Event::StreamReadable(id));
                    }
                }
                if self.streams.unaccepted_count() > before {
                    self.events.push_back(Event::StreamOpened);
                }
            }
            Frame::RstStream(rst) => {
                if let Some(id) = self.streams.received_rst(&rst, &mut self.conn_flow)? {
                    self.events.push_back(Event::StreamReadable(id));
                }
            }
            Frame::StopSending { id, error_code } => {
                if let Some(rst) = self.streams.received_stop_sending(id, error_code)? {
                    self.packer.queue_control(rst);
                }
            }
            Frame::MaxData(offset) => {
                if self.conn_flow.update_send_window(offset) {
                    self.streams.connection_window_opened();
                }
            }
            Frame::MaxStreamData { id, offset } => {
                if let Some(id) = self.streams.received_max_stream_data(id, offset)? {
                    self.events.push_back(Event::StreamWritable(id));
                }
            }
            Frame::Blocked { offset } => {
                debug!(offset, "peer reports connection-level blockage");
            }
            Frame::StreamBlocked { id, offset } => {
                debug!(%id, offset, "peer reports stream blockage");
            }
            Frame::NewToken { .. } => {
                // Token caching for later connections lives above this crate
                trace!("ignoring NEW_TOKEN");
            }
            Frame::Close(close) => {
                trace!("connection closed by peer");
                self.terminate(ConnectionError::ConnectionClosed(close));
            }
        }
        Ok(())
    }

    /// Pump ordered handshake bytes through the crypto session
    fn drain_crypto_stream(&mut self, level: EncryptionLevel) -> Result<(), TransportError> {
        while let Some(chunk) = self.spaces[level].crypto_stream.read(usize::MAX) {
            let out = self.crypto.handshake_tick(&chunk.bytes)?;
            for (out_level, bytes) in out {
                self.spaces[out_level].queue_crypto(Bytes::from(bytes));
            }
        }
        Ok(())
    }

    /// Fire state-change events once the handshake advances
    fn after_handshake_progress(&mut self, now: Instant) {
        if self.handshake_done || !self.crypto.is_handshake_complete() {
            return;
        }
        self.handshake_done = true;
        self.state = State::Established;
        self.timers.stop(Timer::Handshake);

        if let Some(params) = self.crypto.peer_params().cloned() {
            self.conn_flow
                .update_send_window(params.connection_receive_window);
            self.streams
                .apply_peer_params(params.max_incoming_streams, params.stream_receive_window);
            self.idle_timeout = self.idle_timeout.min(params.idle_timeout);
            if self.local_params.omit_connection_id {
                self.packer.omit_connection_id = true;
            }
        }
        self.advance_state(ConnState::VersionNegotiated);
        self.advance_state(ConnState::Secure);
        self.advance_state(ConnState::ForwardSecure);
        self.events.push_back(Event::Connected);
        self.reset_idle_timeout(now);
        if self.config.keep_alive {
            self.timers
                .set(Timer::KeepAlive, now + self.idle_timeout / 2);
        }
        if self.side.is_server() {
            if let Some(key) = &self.token_key {
                // A fresh address token spares the client the rejection
                // round trip on its next connection
                let token = key.issue(&crate::crypto::addr_bytes(&self.remote));
                self.packer.queue_control(Frame::NewToken {
                    token: Bytes::from(token),
                });
            }
        }
        trace!("connection established");
    }

    fn advance_state(&mut self, state: ConnState) {
        if state > self.reported_state {
            self.reported_state = state;
            self.events.push_back(Event::StateChanged(state));
        }
    }

    //
    // Version negotiation
    //

    fn handle_version_negotiation(&mut self, now: Instant, versions: Vec<VersionNumber>) {
        if self.side.is_server() {
            trace!("ignoring version negotiation sent to a server");
            return;
        }
        if self.version_negotiated || !self.state.is_handshake() {
            trace!("ignoring late version negotiation");
            return;
        }
        if versions.contains(&self.version) {
            // A genuine server would have accepted this version; treat the
            // packet as forged
            debug!(
                version = %self.version,
                "version negotiation offers the version we are already using"
            );
            return;
        }
        let Some(version) = highest_common_version(&self.config.versions, &versions) else {
            warn!("no common protocol version with the server");
            self.terminate(ConnectionError::VersionMismatch);
            return;
        };

        debug!(from = %self.version, to = %version, "switching version");
        let cid = ConnectionId::random(&mut self.rng, crate::PUBLIC_HEADER_CID_SIZE);
        self.endpoint_events
            .push_back(EndpointEvent(EndpointEventInner::CidChanged(cid)));

        // Restart the connection under the new version: fresh packet number
        // spaces, a fresh crypto session, a fresh hello
        self.version = version;
        self.version_negotiated = true;
        self.packer = PacketPacker::new(self.side, version, cid);
        self.packet_numbers = PacketNumberGenerator::new();
        self.spaces = [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()];
        self.in_flight = InFlight::new();
        self.crypto_count = 0;
        self.pto_count = 0;
        self.crypto = self.config.crypto.start_session(
            self.side,
            SessionOpts {
                server_name: self.server_name.clone(),
                params: self.local_params.clone(),
                remote: self.remote,
                version,
                token_key: self.token_key.clone(),
                accept_cookie: self.config.accept_cookie.clone(),
            },
        );
        self.start_handshake(now);
        self.advance_state(ConnState::VersionNegotiated);
    }

    //
    // Acknowledgement processing and loss detection
    //

    /// Consume an ACK frame
    ///
    /// Acknowledged numbers are resolved against every space: the sequence
    /// is connection-wide, so each number lives in at most one.
    fn on_ack_received(&mut self, now: Instant, ack: frame::Ack) -> Result<(), TransportError> {
        if ack.largest >= self.packet_numbers.peek() {
            return Err(TransportError::INVALID_ACK_DATA(
                "acknowledged a packet that was never sent",
            ));
        }

        for level in EncryptionLevel::iter() {
            let space = &mut self.spaces[level];
            if let Some(info) = space.sent_packets.get(&ack.largest) {
                space.largest_acked_packet = Some(
                    space
                        .largest_acked_packet
                        .map_or(ack.largest, |x| x.max(ack.largest)),
                );
                if info.ack_eliciting {
                    let rtt_sample = now.saturating_duration_since(info.time_sent);
                    let ack_delay = cmp::min(Duration::from_micros(ack.delay), ACK_DELAY);
                    self.rtt.update(ack_delay, rtt_sample);
                }
            }
        }

        for level in EncryptionLevel::iter() {
            let newly_acked = ack
                .iter()
                .flat_map(|range| {
                    self.spaces[level]
                        .sent_packets
                        .range(range)
                        .map(|(&n, _)| n)
                })
                .collect::<Vec<_>>();
            if newly_acked.is_empty() {
                continue;
            }
            let largest_newly_acked = *newly_acked.iter().max().unwrap();
            let space = &mut self.spaces[level];
            space.largest_acked_packet = Some(
                space
                    .largest_acked_packet
                    .map_or(largest_newly_acked, |x| x.max(largest_newly_acked)),
            );
            for &packet in &newly_acked {
                self.on_packet_acked(level, packet);
            }
        }

        self.detect_lost_packets(now);
        self.crypto_count = 0;
        self.pto_count = 0;
        self.set_loss_detection_timer();
        Ok(())
    }

    fn on_packet_acked(&mut self, level: EncryptionLevel, packet: u64) {
        let info = match self.spaces[level].sent_packets.remove(&packet) {
            Some(x) => x,
            None => return,
        };
        self.in_flight.remove(&info);
        if info.ack_eliciting && !self.in_recovery(info.time_sent) {
            if self.congestion_window < self.ssthresh {
                // Slow start
                self.congestion_window += u64::from(info.size);
            } else {
                // Congestion avoidance
                self.congestion_window +=
                    MAX_PACKET_SIZE as u64 * u64::from(info.size) / self.congestion_window;
            }
        }

        for meta in &info.stream_frames {
            if let Some(id) = self.streams.ack(meta) {
                self.events.push_back(Event::StreamFinished(id));
            }
        }
        // Delivered ACK ranges need no further acknowledgement from us
        self.spaces[level].pending_acks.subtract(&info.acks);
    }

    fn detect_lost_packets(&mut self, now: Instant) {
        let loss_delay = self.loss_delay();
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost_ack_eliciting = false;
        let mut largest_lost_time: Option<Instant> = None;
        for level in EncryptionLevel::iter() {
            let space = &mut self.spaces[level];
            space.loss_time = None;
            let Some(largest_acked) = space.largest_acked_packet else {
                continue;
            };
            let lost_pn = largest_acked.saturating_sub(PACKET_THRESHOLD);

            let mut lost = Vec::new();
            for (&packet, info) in space.sent_packets.range(..largest_acked) {
                if packet <= lost_pn
                    || lost_send_time.map_or(false, |cutoff| info.time_sent <= cutoff)
                {
                    lost.push(packet);
                } else {
                    let next_loss_time = info.time_sent + loss_delay;
                    space.loss_time = Some(
                        space
                            .loss_time
                            .map_or(next_loss_time, |x| x.min(next_loss_time)),
                    );
                }
            }
            if lost.is_empty() {
                continue;
            }
            trace!(?lost, %level, "packets lost");
            self.lost_packets += lost.len() as u64;
            for packet in lost {
                let info = self.spaces[level].sent_packets.remove(&packet).unwrap();
                self.in_flight.remove(&info);
                lost_ack_eliciting |= info.ack_eliciting;
                largest_lost_time = Some(
                    largest_lost_time.map_or(info.time_sent, |x| x.max(info.time_sent)),
                );
                self.requeue_lost(level, info);
            }
        }
        if lost_ack_eliciting {
            self.congestion_event(now, largest_lost_time.unwrap());
        }
    }

    /// Queue a lost packet's retransmittable content for fresh transmission
    ///
    /// ACK and STOP_WAITING frames are regenerated from live state and never
    /// retransmitted as-is.
    fn requeue_lost(&mut self, level: EncryptionLevel, info: SentPacket) {
        for meta in &info.stream_frames {
            self.streams.retransmit(meta);
        }
        let r = info.retransmits;
        // Handshake data returns to the front of its level's queue so the
        // peer's reassembly is not stalled
        for crypto in r.crypto.into_iter().rev() {
            self.spaces[level].pending_crypto.push_front(crypto);
        }
        if r.max_data {
            self.packer
                .queue_control(Frame::MaxData(self.conn_flow.receive_window()));
        }
        for id in r.max_stream_data {
            if let Some(offset) = self.streams.receive_window(id) {
                self.packer.queue_control(Frame::MaxStreamData { id, offset });
            }
        }
        for (id, error_code, final_offset) in r.rst_stream {
            self.packer.queue_control(Frame::RstStream(frame::RstStream {
                id,
                error_code,
                final_offset,
            }));
        }
        for (id, error_code) in r.stop_sending {
            self.packer
                .queue_control(Frame::StopSending { id, error_code });
        }
        for token in r.new_tokens {
            self.packer.queue_control(Frame::NewToken { token });
        }
    }

    /// Time threshold for loss: 9/8 of the round-trip estimate
    fn loss_delay(&self) -> Duration {
        let rtt = cmp::max(self.rtt.latest, self.rtt.smoothed.unwrap_or(self.rtt.latest));
        let rtt = cmp::max(rtt, self.config.initial_rtt);
        rtt + rtt / 8
    }

    fn congestion_event(&mut self, now: Instant, sent_time: Instant) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.recovery_start_time = now;
        self.congestion_window = cmp::max(self.congestion_window / 2, MINIMUM_WINDOW);
        self.ssthresh = self.congestion_window;
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        sent_time <= self.recovery_start_time
    }

    fn set_loss_detection_timer(&mut self) {
        if self.in_flight.crypto != 0 {
            // Handshake retransmission alarm
            let timeout = 2 * self.rtt.smoothed.unwrap_or(self.config.initial_rtt);
            let timeout = cmp::max(timeout, TIMER_GRANULARITY)
                * 2u32.pow(cmp::min(self.crypto_count, MAX_BACKOFF_EXPONENT));
            if let Some(sent) = self.time_of_last_sent_crypto_packet {
                self.timers.set(Timer::LossDetection, sent + timeout);
            }
            return;
        }

        if self.in_flight.ack_eliciting == 0 {
            self.timers.stop(Timer::LossDetection);
            return;
        }

        if let Some(loss_time) = EncryptionLevel::iter()
            .filter_map(|l| self.spaces[l].loss_time)
            .min()
        {
            // Time-threshold loss detection
            self.timers.set(Timer::LossDetection, loss_time);
            return;
        }

        let timeout = self.pto() * 2u32.pow(cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT));
        if let Some(sent) = self.time_of_last_sent_ack_eliciting_packet {
            self.timers.set(Timer::LossDetection, sent + timeout);
        }
    }

    /// Probe timeout
    fn pto(&self) -> Duration {
        let rtt = self.rtt.smoothed.unwrap_or(self.config.initial_rtt);
        cmp::max(rtt + 4 * self.rtt.var + ACK_DELAY, TIMER_GRANULARITY)
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        if self.in_flight.crypto != 0 {
            // The handshake alarm fired; every outstanding handshake packet
            // is retransmitted at its original level
            trace!("retransmitting handshake packets");
            let mut requeue = Vec::new();
            for level in EncryptionLevel::iter() {
                let space = &mut self.spaces[level];
                let numbers = space
                    .sent_packets
                    .iter()
                    .filter(|(_, info)| info.is_crypto_packet)
                    .map(|(&n, _)| n)
                    .collect::<Vec<_>>();
                for number in numbers {
                    let info = space.sent_packets.remove(&number).unwrap();
                    requeue.push((level, info));
                }
            }
            self.lost_packets += requeue.len() as u64;
            for (level, info) in requeue {
                self.in_flight.remove(&info);
                self.requeue_lost(level, info);
            }
            self.crypto_count = self.crypto_count.saturating_add(1);
        } else if EncryptionLevel::iter().any(|l| self.spaces[l].loss_time.is_some()) {
            self.detect_lost_packets(now);
        } else {
            trace!(in_flight = self.in_flight.bytes, "probe timeout");
            let level = self.crypto.current_level();
            self.spaces[level].ping_pending = true;
            self.pto_count = self.pto_count.saturating_add(1);
        }
        self.set_loss_detection_timer();
    }

    //
    // Timers
    //

    /// Advance all timers that are due
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            match timer {
                Timer::LossDetection => self.on_loss_detection_timeout(now),
                Timer::AckDelay => {
                    for level in EncryptionLevel::iter() {
                        self.spaces[level].pending_acks.on_ack_delay_elapsed();
                    }
                }
                Timer::Idle => {
                    debug!("idle timeout");
                    self.terminate(ConnectionError::TimedOut);
                }
                Timer::Handshake => {
                    debug!("handshake timed out");
                    self.events
                        .push_back(Event::ConnectionLost(ConnectionError::HandshakeTimeout));
                    self.begin_close(
                        now,
                        ConnectionClose {
                            error_code: crate::transport_error::Code::HANDSHAKE_TIMEOUT,
                            reason: Bytes::from_static(b"handshake timed out"),
                        },
                    );
                }
                Timer::KeepAlive => {
                    trace!("sending keep-alive");
                    let level = self.crypto.current_level();
                    self.spaces[level].ping_pending = true;
                    self.timers.set(Timer::KeepAlive, now + self.idle_timeout / 2);
                }
                Timer::Close => {
                    self.state = State::Drained;
                    self.endpoint_events
                        .push_back(EndpointEvent(EndpointEventInner::Drained));
                }
            }
        }
    }

    /// The next instant at which [`handle_timeout`](Self::handle_timeout)
    /// must be called
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    fn reset_idle_timeout(&mut self, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        self.timers.set(Timer::Idle, now + self.idle_timeout);
    }

    //
    // Transmission
    //

    /// Produce the next packet to send, if any
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        match self.state {
            State::Drained => return None,
            State::Closed { .. } => {
                if !std::mem::take(&mut self.close_pending) {
                    return None;
                }
                let close = match &self.state {
                    State::Closed { reason } => reason.clone(),
                    _ => unreachable!(),
                };
                let mut buffer = self.pool.lease();
                self.packer.pack(
                    now,
                    &*self.crypto,
                    &mut self.packet_numbers,
                    &mut self.spaces,
                    &mut self.streams,
                    &mut self.conn_flow,
                    Some(&close),
                    true,
                    buffer.as_mut_vec(),
                )?;
                return Some(Transmit {
                    destination: self.remote,
                    contents: buffer,
                });
            }
            State::Handshake | State::Established => {}
        }

        // Window updates ride along with whatever goes out next
        let mut updates = Vec::new();
        self.streams.window_updates(
            now,
            self.rtt.smoothed.unwrap_or(self.config.initial_rtt),
            &mut self.conn_flow,
            &mut updates,
        );
        for frame in updates {
            self.packer.queue_control(frame);
        }

        let congestion_blocked =
            self.in_flight.bytes + MAX_PACKET_SIZE as u64 > self.congestion_window;
        if congestion_blocked && !self.ack_or_crypto_pending() {
            return None;
        }

        let mut buffer = self.pool.lease();
        let packed = self.packer.pack(
            now,
            &*self.crypto,
            &mut self.packet_numbers,
            &mut self.spaces,
            &mut self.streams,
            &mut self.conn_flow,
            None,
            !congestion_blocked,
            buffer.as_mut_vec(),
        )?;
        self.on_packet_sent(now, &packed, buffer.len() as u16);
        Some(Transmit {
            destination: self.remote,
            contents: buffer,
        })
    }

    /// Whether something exempt from the congestion gate wants out
    fn ack_or_crypto_pending(&self) -> bool {
        EncryptionLevel::iter().any(|l| {
            self.spaces[l].pending_acks.ack_required() || !self.spaces[l].pending_crypto.is_empty()
        })
    }

    fn on_packet_sent(&mut self, now: Instant, packed: &PackedPacket, size: u16) {
        let in_flight_size = if packed.ack_eliciting { size } else { 0 };
        let info = SentPacket {
            time_sent: now,
            size: in_flight_size,
            ack_eliciting: packed.ack_eliciting,
            is_crypto_packet: packed.is_crypto_packet,
            acks: packed.acks.clone(),
            retransmits: packed.retransmits.clone(),
            stream_frames: packed.stream_frames.clone(),
        };
        self.in_flight.insert(&info);
        self.spaces[packed.level]
            .sent_packets
            .insert(packed.number, info);
        if packed.ack_eliciting {
            self.time_of_last_sent_ack_eliciting_packet = Some(now);
            if packed.is_crypto_packet {
                self.time_of_last_sent_crypto_packet = Some(now);
            }
            self.set_loss_detection_timer();
        }
    }

    //
    // Application interface
    //

    /// Application-facing events, drained in order
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Events destined for this connection's endpoint
    pub fn poll_endpoint_events(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front()
    }

    /// Open a new outgoing stream, if the peer's limit allows
    pub fn open_stream(&mut self) -> Option<StreamId> {
        if self.state.is_closed() {
            return None;
        }
        self.streams.open()
    }

    /// Next incoming stream the application has not seen yet
    pub fn accept_stream(&mut self) -> Option<StreamId> {
        self.streams.accept()
    }

    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.state.is_closed() {
            return Err(ReadError::UnknownStream);
        }
        self.streams.read(id, buf, &mut self.conn_flow)
    }

    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        if self.state.is_closed() {
            return Err(WriteError::ClosedStream);
        }
        self.streams.write(id, data)
    }

    /// Mark end-of-stream; the FIN rides on the next packed frame
    pub fn finish(&mut self, id: StreamId) -> Result<(), FinishError> {
        if self.state.is_closed() {
            return Err(FinishError::ClosedStream);
        }
        self.streams.finish(id)
    }

    /// Abandon the send direction with an application error code
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) {
        if self.state.is_closed() {
            return;
        }
        if let Some(frame) = self.streams.reset(id, error_code) {
            self.packer.queue_control(frame);
        }
    }

    /// Abandon the receive direction with an application error code
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) {
        if self.state.is_closed() {
            return;
        }
        if let Some(frame) = self
            .streams
            .stop_sending(id, error_code, &mut self.conn_flow)
        {
            self.packer.queue_control(frame);
        }
    }

    /// Close the connection, notifying the peer
    pub fn close(&mut self, now: Instant, error_code: crate::TransportErrorCode, reason: &str) {
        if self.state.is_closed() {
            return;
        }
        self.begin_close(
            now,
            ConnectionClose {
                error_code,
                reason: Bytes::copy_from_slice(reason.as_bytes()),
            },
        );
    }

    fn close_with_error(&mut self, now: Instant, error: TransportError) {
        if self.state.is_closed() {
            return;
        }
        warn!("closing connection: {error}");
        self.events
            .push_back(Event::ConnectionLost(ConnectionError::TransportError(
                error.clone(),
            )));
        self.begin_close(now, error.into());
    }

    fn begin_close(&mut self, now: Instant, close: ConnectionClose) {
        self.packer.clear_control();
        self.streams.clear();
        self.close_pending = true;
        self.state = State::Closed { reason: close };
        self.timers.reset();
        self.timers.set(Timer::Close, now + 3 * self.pto());
    }

    /// Tear down immediately without telling the peer; used for remote
    /// closure, resets, and timeouts
    fn terminate(&mut self, reason: ConnectionError) {
        self.events.push_back(Event::ConnectionLost(reason));
        self.streams.clear();
        self.packer.clear_control();
        self.timers.reset();
        self.state = State::Drained;
        self.endpoint_events
            .push_back(EndpointEvent(EndpointEventInner::Drained));
    }

    //
    // Introspection
    //

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The protocol version in use, possibly renegotiated
    pub fn version(&self) -> VersionNumber {
        self.version
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, State::Handshake)
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// Connection ID currently used on the wire
    pub fn connection_id(&self) -> ConnectionId {
        self.packer.dst_cid
    }

    #[cfg(test)]
    pub(crate) fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    /// Timers the test harness must honor for the simulation to progress;
    /// idle-class timers are left to the tests that exercise them
    #[cfg(test)]
    pub(crate) fn next_urgent_timeout(&mut self) -> Option<Instant> {
        [Timer::LossDetection, Timer::AckDelay, Timer::Close]
            .into_iter()
            .filter_map(|t| self.timers.get(t))
            .min()
    }

    #[cfg(test)]
    pub(crate) fn lost_packet_count(&self) -> u64 {
        self.lost_packets
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("remote", &self.remote)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Datagrams routed to a connection by its endpoint
pub struct ConnectionEvent(pub(crate) ConnectionEventInner);

pub(crate) enum ConnectionEventInner {
    Datagram {
        now: Instant,
        remote: SocketAddr,
        data: BytesMut,
    },
}

/// Things that happened on a connection, drained via
/// [`Connection::poll`]
#[derive(Debug)]
pub enum Event {
    /// The handshake completed; streams may flow freely
    Connected,
    /// The connection advanced to a new security state
    StateChanged(ConnState),
    /// One or more new incoming streams may be accepted
    StreamOpened,
    /// A read on this stream will make progress
    StreamReadable(StreamId),
    /// The peer granted more send window on this stream
    StreamWritable(StreamId),
    /// All data and the FIN on this stream were delivered
    StreamFinished(StreamId),
    /// The connection is dead; every pending operation fails with the reason
    ConnectionLost(ConnectionError),
}

/// Security state of a connection, reported through
/// [`Event::StateChanged`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ConnState {
    /// Nothing agreed yet
    Initial,
    /// The server demonstrably speaks our version
    VersionNegotiated,
    /// Handshake-derived keys protect traffic, not yet forward-secure
    Secure,
    /// Final keys in place
    ForwardSecure,
}

/// Reasons a connection terminated
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    /// The peer violated the protocol, or we did and noticed
    #[error("transport error: {0}")]
    TransportError(TransportError),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// A stateless public reset arrived for this connection
    #[error("reset by peer")]
    Reset,
    /// No packet was received within the idle timeout
    #[error("timed out")]
    TimedOut,
    /// The handshake did not complete in time
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The server offered none of our versions
    #[error("no common protocol version")]
    VersionMismatch,
}

enum State {
    Handshake,
    Established,
    /// We closed; the close frame repeats if the peer keeps talking
    Closed { reason: ConnectionClose },
    /// Dead; the endpoint's tombstone absorbs stragglers
    Drained,
}

impl State {
    fn is_handshake(&self) -> bool {
        matches!(self, State::Handshake)
    }

    fn is_closed(&self) -> bool {
        matches!(self, State::Closed { .. } | State::Drained)
    }

    fn is_drained(&self) -> bool {
        matches!(self, State::Drained)
    }
}

/// Smoothed round-trip estimation in the style of RFC 6298
struct RttEstimator {
    /// Most recent sample
    latest: Duration,
    smoothed: Option<Duration>,
    var: Duration,
    min: Duration,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            latest: Duration::ZERO,
            smoothed: None,
            var: Duration::ZERO,
            min: Duration::MAX,
        }
    }

    fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // The minimum ignores ack delay
        self.min = cmp::min(self.min, self.latest);
        // Adjust for ack delay when plausible
        if self.latest >= self.min + ack_delay {
            self.latest -= ack_delay;
        }
        if let Some(smoothed) = self.smoothed {
            let var_sample = if smoothed > self.latest {
                smoothed - self.latest
            } else {
                self.latest - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + self.latest) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
        }
    }
}

/// Summary of packets sent but neither acknowledged nor deemed lost
struct InFlight {
    /// Bytes in flight counted by congestion control; ack-only packets are
    /// exempt so congestion cannot choke congestion feedback
    bytes: u64,
    /// Packets bearing handshake data
    crypto: u64,
    /// Packets expecting acknowledgement
    ack_eliciting: u64,
}

impl InFlight {
    fn new() -> Self {
        Self {
            bytes: 0,
            crypto: 0,
            ack_eliciting: 0,
        }
    }

    fn insert(&mut self, packet: &SentPacket) {
        self.bytes += u64::from(packet.size);
        self.crypto += u64::from(packet.is_crypto_packet);
        self.ack_eliciting += u64::from(packet.ack_eliciting);
    }

    fn remove(&mut self, packet: &SentPacket) {
        self.bytes -= u64::from(packet.size);
        self.crypto -= u64::from(packet.is_crypto_packet);
        self.ack_eliciting -= u64::from(packet.ack_eliciting);
    }
}

const INITIAL_WINDOW: u64 = 10 * MAX_PACKET_SIZE as u64;
const MINIMUM_WINDOW: u64 = 2 * MAX_PACKET_SIZE as u64;

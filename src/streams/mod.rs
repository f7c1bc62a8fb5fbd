use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::{
    flow_control::FlowController,
    frame::{self, StreamMeta},
    transport_error::TransportError,
    Side, StreamId, CRYPTO_STREAM_ID, HEADERS_STREAM_ID,
};

mod recv;
mod send;

pub use recv::ReadError;
pub use send::{FinishError, WriteError};

use recv::Recv;
use send::Send;

/// Sizing knobs for new streams
#[derive(Debug, Clone)]
pub(crate) struct StreamsConfig {
    /// Cap on concurrently open peer-initiated streams
    pub(crate) max_incoming: u64,
    pub(crate) stream_receive_window: u64,
    pub(crate) max_stream_receive_window: u64,
    /// Send window assumed before the peer's parameters arrive
    pub(crate) initial_send_window: u64,
    /// Per-stream cap on buffered outgoing data
    pub(crate) send_buffer_size: usize,
}

struct StreamEntry {
    send: Send,
    recv: Recv,
    flow: FlowController,
    /// Whether the stream sits in the round-robin transmit queue
    queued: bool,
}

/// All application streams of a connection: allocation, lookup, lifecycle,
/// and transmit scheduling
pub(crate) struct Streams {
    side: Side,
    config: StreamsConfig,
    entries: FxHashMap<StreamId, StreamEntry>,
    /// Closed streams, remembered so late frames are silently absorbed
    tombstones: FxHashSet<StreamId>,
    /// Next stream ID to assign locally
    next_outgoing: u64,
    /// Highest peer-initiated stream seen
    highest_incoming: u64,
    /// Peer's cap on streams we initiate; refreshed from its parameters
    max_outgoing: u64,
    incoming_open: usize,
    outgoing_open: usize,
    /// Send window for new streams, dictated by the peer's parameters
    peer_stream_window: u64,
    /// Round-robin queue of streams that may have data to send
    pending: VecDeque<StreamId>,
    /// Peer-opened streams not yet handed to the application
    opened: VecDeque<StreamId>,
    /// BLOCKED/STREAM_BLOCKED frames generated while packing
    blocked_frames: Vec<frame::Frame>,
    /// Offset at which a connection-level BLOCKED was already queued
    conn_blocked_at: Option<u64>,
}

impl Streams {
    pub(crate) fn new(side: Side, config: StreamsConfig) -> Self {
        Self {
            side,
            // The crypto and headers streams make the first usable
            // client ID 5; servers start at 2
            next_outgoing: if side.is_client() {
                HEADERS_STREAM_ID.0 + 2
            } else {
                2
            },
            highest_incoming: 0,
            max_outgoing: 100,
            incoming_open: 0,
            outgoing_open: 0,
            peer_stream_window: config.initial_send_window,
            entries: FxHashMap::default(),
            tombstones: FxHashSet::default(),
            pending: VecDeque::new(),
            opened: VecDeque::new(),
            blocked_frames: Vec::new(),
            conn_blocked_at: None,
            config,
        }
    }

    /// Stream IDs more than this far below the newest are rejected outright
    fn max_new_stream_id_delta(&self) -> u64 {
        4 * self.config.max_incoming
    }

    pub(crate) fn apply_peer_params(&mut self, max_incoming_streams: u32, stream_window: u64) {
        self.max_outgoing = u64::from(max_incoming_streams);
        self.peer_stream_window = stream_window;
        for entry in self.entries.values_mut() {
            entry.flow.update_send_window(stream_window);
        }
    }

    fn new_entry(&self) -> StreamEntry {
        StreamEntry {
            send: Send::new(self.config.send_buffer_size),
            recv: Recv::new(),
            flow: FlowController::new(
                self.config.stream_receive_window,
                self.config.max_stream_receive_window,
                self.peer_stream_window,
                true,
            ),
            queued: false,
        }
    }

    /// Open a locally-initiated stream, if the peer's cap allows another
    pub(crate) fn open(&mut self) -> Option<StreamId> {
        if self.outgoing_open as u64 >= self.max_outgoing {
            return None;
        }
        let id = StreamId(self.next_outgoing);
        self.next_outgoing += 2;
        self.outgoing_open += 1;
        self.entries.insert(id, self.new_entry());
        trace!(%id, "opened");
        Some(id)
    }

    /// Next peer-initiated stream the application hasn't seen
    pub(crate) fn accept(&mut self) -> Option<StreamId> {
        self.opened.pop_front()
    }

    /// Peer-opened streams awaiting [`accept`](Self::accept)
    pub(crate) fn unaccepted_count(&self) -> usize {
        self.opened.len()
    }

    /// The receive window currently advertised for `id`, for regenerating a
    /// lost window update
    pub(crate) fn receive_window(&self, id: StreamId) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.flow.receive_window())
    }

    /// Look up `id`, creating it if the peer may open it
    ///
    /// `Ok(None)` means the stream lived and died already; late frames for
    /// it are dropped without ceremony.
    fn get_or_open(&mut self, id: StreamId) -> Result<Option<&mut StreamEntry>, TransportError> {
        if id == CRYPTO_STREAM_ID {
            return Err(TransportError::INVALID_STREAM_ID(
                "stream 1 is reserved for handshake data",
            ));
        }
        if self.tombstones.contains(&id) {
            return Ok(None);
        }
        if self.entries.contains_key(&id) {
            return Ok(self.entries.get_mut(&id));
        }
        if id.initiator() == self.side {
            return Err(TransportError::INVALID_STREAM_ID(format!(
                "peer referenced {} before we opened it",
                id
            )));
        }

        let delta = self.max_new_stream_id_delta();
        if id.0 < self.highest_incoming.saturating_sub(delta) {
            return Err(TransportError::INVALID_STREAM_ID(format!(
                "{} is {} below the highest peer stream {}",
                id,
                self.highest_incoming - id.0,
                self.highest_incoming
            )));
        }
        if self.incoming_open as u64 >= self.config.max_incoming {
            return Err(TransportError::TOO_MANY_OPEN_STREAMS(format!(
                "peer exceeded its limit of {} streams",
                self.config.max_incoming
            )));
        }

        let entry = self.new_entry();
        self.entries.insert(id, entry);
        self.incoming_open += 1;
        self.highest_incoming = self.highest_incoming.max(id.0);
        self.opened.push_back(id);
        trace!(%id, "peer opened");
        self.collect_tombstones();
        Ok(self.entries.get_mut(&id))
    }

    /// Drop tombstones old enough that the ID-distance check rejects their
    /// IDs anyway
    fn collect_tombstones(&mut self) {
        let incoming_floor = self.highest_incoming.saturating_sub(self.max_new_stream_id_delta());
        let outgoing_floor = self.next_outgoing.saturating_sub(self.max_new_stream_id_delta());
        let side = self.side;
        self.tombstones.retain(|id| {
            if id.initiator() == side {
                id.0 >= outgoing_floor
            } else {
                id.0 >= incoming_floor
            }
        });
    }

    /// Discard a stream once both halves are done
    fn maybe_cleanup(&mut self, id: StreamId) {
        let done = match self.entries.get(&id) {
            Some(entry) => entry.send.is_finished() && entry.recv.is_closed(),
            None => return,
        };
        if !done {
            return;
        }
        self.entries.remove(&id);
        self.tombstones.insert(id);
        if id.initiator() == self.side {
            self.outgoing_open -= 1;
        } else {
            self.incoming_open -= 1;
        }
        trace!(%id, "closed");
    }

    //
    // Application operations
    //

    pub(crate) fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        let entry = self.entries.get_mut(&id).ok_or(WriteError::ClosedStream)?;
        let n = entry.send.write(data)?;
        if !entry.queued {
            entry.queued = true;
            self.pending.push_back(id);
        }
        Ok(n)
    }

    pub(crate) fn read(
        &mut self,
        id: StreamId,
        buf: &mut [u8],
        conn_flow: &mut FlowController,
    ) -> Result<usize, ReadError> {
        let entry = self.entries.get_mut(&id).ok_or(ReadError::UnknownStream)?;
        let result = entry.recv.read(buf);
        if let Ok(n) = result {
            entry.flow.add_bytes_read(n as u64);
            if entry.flow.contributes_to_connection {
                conn_flow.add_bytes_read(n as u64);
            }
        }
        if matches!(result, Err(ReadError::Finished) | Err(ReadError::Reset(_))) {
            self.maybe_cleanup(id);
        }
        result
    }

    pub(crate) fn finish(&mut self, id: StreamId) -> Result<(), FinishError> {
        let entry = self.entries.get_mut(&id).ok_or(FinishError::ClosedStream)?;
        entry.send.finish()?;
        if !entry.queued {
            entry.queued = true;
            self.pending.push_back(id);
        }
        Ok(())
    }

    /// Abandon the send half; returns the RST_STREAM to queue
    pub(crate) fn reset(&mut self, id: StreamId, error_code: u64) -> Option<frame::Frame> {
        let entry = self.entries.get_mut(&id)?;
        let final_offset = entry.send.reset()?;
        let frame = frame::Frame::RstStream(frame::RstStream {
            id,
            error_code,
            final_offset,
        });
        self.maybe_cleanup(id);
        Some(frame)
    }

    /// Abandon the receive half; returns the STOP_SENDING to queue
    pub(crate) fn stop_sending(
        &mut self,
        id: StreamId,
        error_code: u64,
        conn_flow: &mut FlowController,
    ) -> Option<frame::Frame> {
        let entry = self.entries.get_mut(&id)?;
        if entry.recv.stopped {
            return None;
        }
        // Credit the connection window for data we'll never read
        let unread = entry.recv.end.saturating_sub(entry.recv.bytes_read());
        entry.recv.stop();
        entry.flow.add_bytes_read(unread);
        if entry.flow.contributes_to_connection {
            conn_flow.add_bytes_read(unread);
        }
        let frame = frame::Frame::StopSending { id, error_code };
        self.maybe_cleanup(id);
        Some(frame)
    }

    pub(crate) fn is_readable(&self, id: StreamId) -> bool {
        self.entries
            .get(&id)
            .map_or(false, |entry| entry.recv.is_readable())
    }

    //
    // Peer frames
    //

    /// Apply a STREAM frame; returns the stream to report readable, if any
    pub(crate) fn received_stream_frame(
        &mut self,
        frame: frame::Stream,
        conn_flow: &mut FlowController,
    ) -> Result<Option<StreamId>, TransportError> {
        let id = frame.id;
        let end = frame.offset + frame.data.len() as u64;
        let Some(entry) = self.get_or_open(id)? else {
            trace!(%id, "stream frame for a dead stream");
            return Ok(None);
        };

        let increment = entry.flow.update_highest_received(end)?;
        if entry.flow.contributes_to_connection && increment > 0 {
            conn_flow.add_highest_received(increment)?;
        }
        entry.recv.ingest(frame)?;
        if entry.recv.stopped && increment > 0 {
            // Data for a stopped stream still owes the window its credit
            entry.flow.add_bytes_read(increment);
            if entry.flow.contributes_to_connection {
                conn_flow.add_bytes_read(increment);
            }
        }
        let readable = entry.recv.is_readable();
        Ok(readable.then_some(id))
    }

    /// Apply RST_STREAM; returns the stream to report readable, if any
    pub(crate) fn received_rst(
        &mut self,
        frame: &frame::RstStream,
        conn_flow: &mut FlowController,
    ) -> Result<Option<StreamId>, TransportError> {
        let id = frame.id;
        let Some(entry) = self.get_or_open(id)? else {
            return Ok(None);
        };
        let increment = entry.flow.update_highest_received(frame.final_offset)?;
        if entry.flow.contributes_to_connection && increment > 0 {
            conn_flow.add_highest_received(increment)?;
        }
        if !entry.recv.reset(frame.error_code, frame.final_offset)? {
            return Ok(None);
        }
        // None of the outstanding bytes will ever be read now
        let unread = frame.final_offset.saturating_sub(entry.recv.bytes_read());
        entry.flow.add_bytes_read(unread);
        if entry.flow.contributes_to_connection {
            conn_flow.add_bytes_read(unread);
        }
        Ok(Some(id))
    }

    /// Apply STOP_SENDING; returns the RST_STREAM to respond with, plus the
    /// stream to report stopped
    pub(crate) fn received_stop_sending(
        &mut self,
        id: StreamId,
        error_code: u64,
    ) -> Result<Option<frame::Frame>, TransportError> {
        let Some(entry) = self.get_or_open(id)? else {
            return Ok(None);
        };
        if !entry.send.try_stop(error_code) {
            return Ok(None);
        }
        // The peer lost interest; abandon transmission
        Ok(self.reset(id, error_code))
    }

    /// Apply MAX_STREAM_DATA; returns the stream to report writable, if the
    /// window actually opened
    pub(crate) fn received_max_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<Option<StreamId>, TransportError> {
        let Some(entry) = self.get_or_open(id)? else {
            return Ok(None);
        };
        let grew = entry.flow.update_send_window(offset);
        if grew {
            entry.send.blocked_sent_at = None;
            if entry.send.is_pending() && !entry.queued {
                entry.queued = true;
                self.pending.push_back(id);
            }
        }
        Ok((grew && self.entries[&id].send.is_pending()).then_some(id))
    }

    /// The connection-level window opened; requeue anything that was waiting
    pub(crate) fn connection_window_opened(&mut self) {
        self.conn_blocked_at = None;
        let mut requeue = Vec::new();
        for (&id, entry) in &mut self.entries {
            if entry.send.is_pending() && !entry.queued {
                entry.queued = true;
                requeue.push(id);
            }
        }
        self.pending.extend(requeue);
    }

    //
    // Packer interface
    //

    /// Whether any stream has data or a FIN ready to transmit
    pub(crate) fn has_pending(&self) -> bool {
        self.pending
            .iter()
            .any(|id| self.entries.get(id).map_or(false, |e| e.send.is_pending()))
    }

    /// Produce at most one STREAM frame, round-robin across pending streams
    ///
    /// `max_bytes` bounds the frame's data payload. Streams stalled on flow
    /// control queue a BLOCKED frame exactly once per stall offset and drop
    /// out of the rotation until their window opens.
    pub(crate) fn next_stream_frame(
        &mut self,
        max_bytes: usize,
        conn_flow: &mut FlowController,
    ) -> Option<(StreamMeta, Bytes)> {
        if max_bytes == 0 {
            return None;
        }
        for _ in 0..self.pending.len() {
            let id = self.pending.pop_front()?;
            let entry = match self.entries.get_mut(&id) {
                Some(x) => x,
                None => continue,
            };
            if !entry.send.is_pending() {
                entry.queued = false;
                continue;
            }

            let retransmit = entry.send.pending.next_is_retransmit();
            let budget = if retransmit {
                max_bytes as u64
            } else {
                let windows = entry
                    .flow
                    .send_window_size()
                    .min(conn_flow.send_window_size());
                if windows == 0 && entry.send.pending.has_unsent_data() {
                    // Stalled; advertise each exhausted limit exactly once
                    if entry.flow.send_window_size() == 0 {
                        let offset = entry.flow.bytes_sent();
                        if entry.send.blocked_sent_at != Some(offset) {
                            entry.send.blocked_sent_at = Some(offset);
                            self.blocked_frames
                                .push(frame::Frame::StreamBlocked { id, offset });
                        }
                    } else {
                        let conn_offset = conn_flow.bytes_sent();
                        if self.conn_blocked_at != Some(conn_offset) {
                            self.conn_blocked_at = Some(conn_offset);
                            self.blocked_frames
                                .push(frame::Frame::Blocked { offset: conn_offset });
                        }
                    }
                    // Leave the queue until a window update arrives
                    let entry = self.entries.get_mut(&id).unwrap();
                    entry.queued = false;
                    continue;
                }
                (max_bytes as u64).min(windows)
            };

            let entry = self.entries.get_mut(&id).unwrap();
            let range = entry.send.pending.poll_transmit(budget as usize);
            if !retransmit && !range.is_empty() {
                let len = range.end - range.start;
                entry.flow.add_bytes_sent(len);
                if entry.flow.contributes_to_connection {
                    conn_flow.add_bytes_sent(len);
                }
            }

            // FIN rides on the frame that exhausts the buffer
            let fin = entry.send.fin_pending
                && range.end == entry.send.offset()
                && !entry.send.pending.next_is_retransmit();
            if range.is_empty() && !fin {
                entry.queued = false;
                continue;
            }
            if fin {
                entry.send.fin_pending = false;
            }

            let mut data = Vec::with_capacity((range.end - range.start) as usize);
            let mut cursor = range.start;
            while cursor < range.end {
                let chunk = entry.send.pending.get(cursor..range.end);
                debug_assert!(!chunk.is_empty(), "send buffer hole");
                data.extend_from_slice(chunk);
                cursor += chunk.len() as u64;
            }

            if entry.send.is_pending() {
                // More to send; stay in the rotation
                self.pending.push_back(id);
            } else {
                entry.queued = false;
            }

            return Some((
                StreamMeta {
                    id,
                    offsets: range,
                    fin,
                },
                Bytes::from(data),
            ));
        }
        None
    }

    /// BLOCKED frames generated while packing, destined for the control queue
    pub(crate) fn take_blocked(&mut self) -> Vec<frame::Frame> {
        std::mem::take(&mut self.blocked_frames)
    }

    //
    // Delivery feedback
    //

    /// A packed frame was acknowledged; returns the stream to report
    /// finished, if the FIN is now fully delivered
    pub(crate) fn ack(&mut self, meta: &StreamMeta) -> Option<StreamId> {
        let entry = self.entries.get_mut(&meta.id)?;
        let finished = entry.send.ack(meta);
        if finished {
            self.maybe_cleanup(meta.id);
            return Some(meta.id);
        }
        None
    }

    /// A packed frame was declared lost; its range re-enters the queue
    pub(crate) fn retransmit(&mut self, meta: &StreamMeta) {
        let Some(entry) = self.entries.get_mut(&meta.id) else {
            return;
        };
        entry.send.retransmit(meta);
        if entry.send.is_pending() && !entry.queued {
            entry.queued = true;
            self.pending.push_back(meta.id);
        }
    }

    /// Collect WINDOW_UPDATE-style frames for streams and the connection
    pub(crate) fn window_updates(
        &mut self,
        now: Instant,
        rtt: Duration,
        conn_flow: &mut FlowController,
        out: &mut Vec<frame::Frame>,
    ) {
        for (&id, entry) in &mut self.entries {
            if entry.recv.is_finished() || entry.recv.stopped {
                continue;
            }
            if let Some(offset) = entry.flow.maybe_update_window(now, rtt) {
                out.push(frame::Frame::MaxStreamData { id, offset });
                // A stream window that turns over quickly should drag the
                // connection window along with it
                conn_flow.ensure_minimum_window_increment(entry.flow.window_increment());
            }
        }
        if let Some(offset) = conn_flow.maybe_update_window(now, rtt) {
            out.push(frame::Frame::MaxData(offset));
        }
    }

    /// Fail every stream, reporting errors to any would-be readers/writers
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.opened.clear();
    }

    #[cfg(test)]
    pub(crate) fn stream_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::transport_error::Code;

    fn config() -> StreamsConfig {
        StreamsConfig {
            max_incoming: 100,
            stream_receive_window: 1 << 16,
            max_stream_receive_window: 1 << 20,
            initial_send_window: 1 << 16,
            send_buffer_size: 1 << 20,
        }
    }

    fn conn_flow() -> FlowController {
        FlowController::new(1 << 20, 1 << 24, 1 << 20, false)
    }

    fn stream_frame(id: u64, offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: StreamId(id),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn open_allocates_monotonic_ids() {
        let mut streams = Streams::new(Side::Client, config());
        assert_eq!(streams.open(), Some(StreamId(5)));
        assert_eq!(streams.open(), Some(StreamId(7)));
        let mut server = Streams::new(Side::Server, config());
        assert_eq!(server.open(), Some(StreamId(2)));
        assert_eq!(server.open(), Some(StreamId(4)));
    }

    #[test]
    fn open_respects_peer_cap() {
        let mut streams = Streams::new(Side::Client, config());
        streams.apply_peer_params(2, 1 << 16);
        assert!(streams.open().is_some());
        assert!(streams.open().is_some());
        assert_eq!(streams.open(), None);
    }

    #[test]
    fn peer_opens_on_first_reference() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        let readable = streams
            .received_stream_frame(stream_frame(5, 0, b"hi", false), &mut flow)
            .unwrap();
        assert_eq!(readable, Some(StreamId(5)));
        assert_eq!(streams.accept(), Some(StreamId(5)));
        assert_eq!(streams.accept(), None);
    }

    #[test]
    fn wrong_parity_is_rejected() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        // Stream 4 would be server-initiated; the peer can't invent it
        let err = streams
            .received_stream_frame(stream_frame(4, 0, b"x", false), &mut flow)
            .unwrap_err();
        assert_eq!(err.code, Code::INVALID_STREAM_ID);
    }

    #[test]
    fn crypto_stream_is_reserved() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        let err = streams
            .received_stream_frame(stream_frame(1, 0, b"x", false), &mut flow)
            .unwrap_err();
        assert_eq!(err.code, Code::INVALID_STREAM_ID);
    }

    #[test]
    fn ancient_stream_id_is_rejected() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        streams
            .received_stream_frame(stream_frame(413, 0, b"x", false), &mut flow)
            .unwrap();
        // 413 - 11 = 402 exceeds the window of 4 * 100
        let err = streams
            .received_stream_frame(stream_frame(11, 0, b"y", false), &mut flow)
            .unwrap_err();
        assert_eq!(err.code, Code::INVALID_STREAM_ID);
        assert!(err.reason.contains("402"), "{}", err.reason);
    }

    #[test]
    fn incoming_cap_enforced() {
        let mut cfg = config();
        cfg.max_incoming = 2;
        let mut streams = Streams::new(Side::Server, cfg);
        let mut flow = conn_flow();
        streams
            .received_stream_frame(stream_frame(5, 0, b"x", false), &mut flow)
            .unwrap();
        streams
            .received_stream_frame(stream_frame(7, 0, b"x", false), &mut flow)
            .unwrap();
        let err = streams
            .received_stream_frame(stream_frame(9, 0, b"x", false), &mut flow)
            .unwrap_err();
        assert_eq!(err.code, Code::TOO_MANY_OPEN_STREAMS);
    }

    #[test]
    fn reordered_frames_read_in_order() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        assert_eq!(
            streams
                .received_stream_frame(stream_frame(5, 3, b"bar", false), &mut flow)
                .unwrap(),
            None
        );
        assert_eq!(
            streams
                .received_stream_frame(stream_frame(5, 0, b"foo", false), &mut flow)
                .unwrap(),
            Some(StreamId(5))
        );
        let mut buf = [0; 16];
        let n = streams.read(StreamId(5), &mut buf, &mut flow).unwrap();
        assert_eq!(&buf[..n], b"foobar");
        assert_matches!(
            streams.read(StreamId(5), &mut buf, &mut flow),
            Err(ReadError::Blocked)
        );
    }

    #[test]
    fn fin_then_read_reports_finished_and_cleans_up() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        streams
            .received_stream_frame(stream_frame(5, 0, b"all of it", true), &mut flow)
            .unwrap();
        let mut buf = [0; 16];
        let n = streams.read(StreamId(5), &mut buf, &mut flow).unwrap();
        assert_eq!(&buf[..n], b"all of it");
        assert_matches!(
            streams.read(StreamId(5), &mut buf, &mut flow),
            Err(ReadError::Finished)
        );
        // The send half is still live, so the entry survives
        assert_eq!(streams.stream_count(), 1);
    }

    #[test]
    fn data_after_fin_is_fatal() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        streams
            .received_stream_frame(stream_frame(5, 0, b"abc", true), &mut flow)
            .unwrap();
        let err = streams
            .received_stream_frame(stream_frame(5, 3, b"d", false), &mut flow)
            .unwrap_err();
        assert_eq!(err.code, Code::STREAM_DATA_AFTER_TERMINATION);
    }

    #[test]
    fn stream_flow_violation() {
        let mut cfg = config();
        cfg.stream_receive_window = 8;
        let mut streams = Streams::new(Side::Server, cfg);
        let mut flow = conn_flow();
        let err = streams
            .received_stream_frame(stream_frame(5, 0, b"123456789", false), &mut flow)
            .unwrap_err();
        assert_eq!(err.code, Code::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA);
    }

    #[test]
    fn frame_production_round_robin_and_fin() {
        let mut streams = Streams::new(Side::Client, config());
        let mut flow = conn_flow();
        let a = streams.open().unwrap();
        let b = streams.open().unwrap();
        streams.write(a, b"aaaa").unwrap();
        streams.write(b, b"bbbb").unwrap();
        streams.finish(a).unwrap();

        let (meta1, data1) = streams.next_stream_frame(usize::MAX, &mut flow).unwrap();
        let (meta2, data2) = streams.next_stream_frame(usize::MAX, &mut flow).unwrap();
        assert!(streams.next_stream_frame(usize::MAX, &mut flow).is_none());
        let (fin_meta, fin_data) = if meta1.id == a {
            (meta1.clone(), &data1)
        } else {
            (meta2.clone(), &data2)
        };
        assert!(fin_meta.fin);
        assert_eq!(&fin_data[..], b"aaaa");
        // S5: after the FIN went out, the stream produces nothing further
        assert!(streams.next_stream_frame(usize::MAX, &mut flow).is_none());
    }

    #[test]
    fn blocked_emitted_once_per_offset() {
        let mut streams = Streams::new(Side::Client, config());
        // Peer grants nothing at all
        streams.apply_peer_params(100, 0);
        let mut flow = conn_flow();
        let id = streams.open().unwrap();
        streams.write(id, b"data").unwrap();
        assert!(streams.next_stream_frame(usize::MAX, &mut flow).is_none());
        let blocked = streams.take_blocked();
        assert_eq!(blocked.len(), 1);
        assert_matches!(blocked[0], frame::Frame::StreamBlocked { offset: 0, .. });

        // Writing more while still stalled must not emit another one
        streams.write(id, b"more").unwrap();
        assert!(streams.next_stream_frame(usize::MAX, &mut flow).is_none());
        assert!(streams.take_blocked().is_empty());

        // A window update re-arms the latch
        streams.received_max_stream_data(id, 8).unwrap();
        let (meta, _) = streams.next_stream_frame(usize::MAX, &mut flow).unwrap();
        assert_eq!(meta.offsets, 0..8);
        streams.write(id, b"even more").unwrap();
        assert!(streams.next_stream_frame(usize::MAX, &mut flow).is_none());
        let blocked = streams.take_blocked();
        assert_eq!(blocked.len(), 1);
        assert_matches!(blocked[0], frame::Frame::StreamBlocked { offset: 8, .. });
    }

    #[test]
    fn retransmit_reenters_queue_with_original_offsets() {
        let mut streams = Streams::new(Side::Client, config());
        let mut flow = conn_flow();
        let id = streams.open().unwrap();
        streams.write(id, b"0123456789").unwrap();
        let (meta, _) = streams.next_stream_frame(4, &mut flow).unwrap();
        assert_eq!(meta.offsets, 0..4);
        let (meta2, _) = streams.next_stream_frame(100, &mut flow).unwrap();
        assert_eq!(meta2.offsets, 4..10);

        streams.retransmit(&meta);
        let (again, data) = streams.next_stream_frame(100, &mut flow).unwrap();
        assert_eq!(again.offsets, 0..4);
        assert_eq!(&data[..], b"0123");
        // Retransmission did not consume additional window
        assert_eq!(flow.bytes_sent(), 10);
    }

    #[test]
    fn stop_sending_resets_stream() {
        let mut streams = Streams::new(Side::Client, config());
        let id = streams.open().unwrap();
        streams.write(id, b"pending").unwrap();
        let frame = streams.received_stop_sending(id, 13).unwrap().unwrap();
        assert_matches!(
            frame,
            frame::Frame::RstStream(frame::RstStream { error_code: 13, .. })
        );
        assert_matches!(streams.write(id, b"x"), Err(WriteError::Stopped(13)));
        // Redundant STOP_SENDING is a no-op
        assert!(streams.received_stop_sending(id, 13).unwrap().is_none());
    }

    #[test]
    fn tombstones_absorb_late_frames() {
        let mut streams = Streams::new(Side::Server, config());
        let mut flow = conn_flow();
        streams
            .received_stream_frame(stream_frame(5, 0, b"x", true), &mut flow)
            .unwrap();
        let mut buf = [0; 4];
        streams.read(StreamId(5), &mut buf, &mut flow).unwrap();
        assert_matches!(
            streams.read(StreamId(5), &mut buf, &mut flow),
            Err(ReadError::Finished)
        );
        // Close our half too; the entry collapses into a tombstone
        assert!(streams.reset(StreamId(5), 0).is_some());
        assert_eq!(streams.stream_count(), 0);
        // A late retransmission must not revive it
        assert_eq!(
            streams
                .received_stream_frame(stream_frame(5, 0, b"x", true), &mut flow)
                .unwrap(),
            None
        );
        assert_eq!(streams.stream_count(), 0);
    }
}

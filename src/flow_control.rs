use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::transport_error::TransportError;

/// Byte-budget accounting for one direction pair of a stream, or for the
/// connection as a whole
///
/// Outbound, `bytes_sent` may never pass `send_window`. Inbound,
/// `highest_received` may never pass `receive_window`; the receive window
/// advances as the application consumes data, growing multiplicatively when
/// it turns over faster than the round trip time allows.
#[derive(Debug)]
pub(crate) struct FlowController {
    send_window: u64,
    bytes_sent: u64,

    receive_window: u64,
    receive_window_increment: u64,
    max_receive_window_increment: u64,
    bytes_read: u64,
    highest_received: u64,
    last_window_update: Option<Instant>,

    /// Whether this stream's traffic counts against the connection window
    pub(crate) contributes_to_connection: bool,
}

/// Grow the connection window half again as fast as the stream windows that
/// feed it
const CONNECTION_WINDOW_MULTIPLIER_NUM: u64 = 3;
const CONNECTION_WINDOW_MULTIPLIER_DEN: u64 = 2;

impl FlowController {
    pub(crate) fn new(
        receive_window: u64,
        max_receive_window: u64,
        send_window: u64,
        contributes_to_connection: bool,
    ) -> Self {
        Self {
            send_window,
            bytes_sent: 0,
            receive_window,
            receive_window_increment: receive_window,
            max_receive_window_increment: max_receive_window,
            bytes_read: 0,
            highest_received: 0,
            last_window_update: None,
            contributes_to_connection,
        }
    }

    //
    // Outbound
    //

    /// Bytes we may still send before blocking
    pub(crate) fn send_window_size(&self) -> u64 {
        self.send_window.saturating_sub(self.bytes_sent)
    }

    pub(crate) fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
        debug_assert!(
            self.bytes_sent <= self.send_window,
            "sent past the peer's window"
        );
    }

    /// Total bytes handed to the packer so far
    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Raise the send window to `offset`; stale updates are ignored
    ///
    /// Returns whether the window actually grew.
    pub(crate) fn update_send_window(&mut self, offset: u64) -> bool {
        if offset <= self.send_window {
            return false;
        }
        self.send_window = offset;
        true
    }

    //
    // Inbound
    //

    /// Record that the peer's stream extends to `offset`
    ///
    /// Returns the number of new bytes this commits against the connection
    /// window, zero when frames merely arrived out of order.
    pub(crate) fn update_highest_received(&mut self, offset: u64) -> Result<u64, TransportError> {
        if offset > self.receive_window {
            debug!(
                offset,
                window = self.receive_window,
                "peer overran the receive window"
            );
            return Err(TransportError::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA(format!(
                "received {} bytes, allowed {} bytes",
                offset, self.receive_window
            )));
        }
        if offset <= self.highest_received {
            // Reordered; already accounted for
            return Ok(0);
        }
        let increment = offset - self.highest_received;
        self.highest_received = offset;
        Ok(increment)
    }

    /// Directly charge new bytes against the window (connection level, where
    /// per-stream increments are aggregated)
    pub(crate) fn add_highest_received(&mut self, increment: u64) -> Result<(), TransportError> {
        self.highest_received += increment;
        if self.highest_received > self.receive_window {
            debug!(
                highest = self.highest_received,
                window = self.receive_window,
                "peer overran the connection receive window"
            );
            return Err(TransportError::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA(format!(
                "received {} bytes for the connection, allowed {} bytes",
                self.highest_received, self.receive_window
            )));
        }
        Ok(())
    }

    pub(crate) fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    /// Offset to advertise in a window update, if one is worthwhile
    ///
    /// A new window is offered once less than half the current increment
    /// remains unconsumed. If the previous window lasted under two round
    /// trips the increment doubles, up to its configured ceiling, so a fast
    /// reader stops being the bottleneck.
    pub(crate) fn maybe_update_window(&mut self, now: Instant, rtt: Duration) -> Option<u64> {
        let remaining = self.receive_window.saturating_sub(self.bytes_read);
        if remaining >= self.receive_window_increment / 2 {
            return None;
        }
        if let Some(last) = self.last_window_update {
            if !rtt.is_zero() && now.duration_since(last) < 2 * rtt {
                self.receive_window_increment = (2 * self.receive_window_increment)
                    .min(self.max_receive_window_increment);
                trace!(
                    increment = self.receive_window_increment,
                    "receive window turning over quickly, growing increment"
                );
            }
        }
        self.last_window_update = Some(now);
        self.receive_window = self.bytes_read + self.receive_window_increment;
        Some(self.receive_window)
    }

    /// Make sure the window grows at least as fast as a stream that feeds it
    pub(crate) fn ensure_minimum_window_increment(&mut self, increment: u64) {
        let increment = increment * CONNECTION_WINDOW_MULTIPLIER_NUM / CONNECTION_WINDOW_MULTIPLIER_DEN;
        if increment > self.receive_window_increment {
            self.receive_window_increment = increment.min(self.max_receive_window_increment);
        }
    }

    pub(crate) fn receive_window(&self) -> u64 {
        self.receive_window
    }

    /// Step by which the receive window currently advances
    pub(crate) fn window_increment(&self) -> u64 {
        self.receive_window_increment
    }
}

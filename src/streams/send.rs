use bytes::Bytes;
use thiserror::Error;

use crate::{frame::StreamMeta, send_buffer::SendBuffer};

/// The transmit half of a stream
#[derive(Debug)]
pub(crate) struct Send {
    pub(super) pending: SendBuffer,
    pub(super) state: SendState,
    /// A FIN still needs to ride out on a STREAM frame
    pub(super) fin_pending: bool,
    /// Error code from a STOP_SENDING, if the peer lost interest
    pub(super) stop_reason: Option<u64>,
    /// Offset at which a BLOCKED frame was already queued; cleared when the
    /// window opens so the next stall reports the new offset exactly once
    pub(super) blocked_sent_at: Option<u64>,
    /// Cap on buffered-but-unacknowledged bytes
    max_buffered: usize,
}

impl Send {
    pub(super) fn new(max_buffered: usize) -> Self {
        Self {
            pending: SendBuffer::new(),
            state: SendState::Ready,
            fin_pending: false,
            stop_reason: None,
            blocked_sent_at: None,
            max_buffered,
        }
    }

    /// Buffer as much of `data` as fits, returning the number of bytes taken
    pub(super) fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Some(code) = self.stop_reason {
            return Err(WriteError::Stopped(code));
        }
        if self.state != SendState::Ready {
            return Err(WriteError::ClosedStream);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let budget = self.max_buffered.saturating_sub(self.buffered());
        if budget == 0 {
            return Err(WriteError::Blocked);
        }
        let len = data.len().min(budget);
        self.pending.write(Bytes::copy_from_slice(&data[..len]));
        Ok(len)
    }

    /// Mark end-of-send; the next packed frame for this stream carries FIN
    pub(super) fn finish(&mut self) -> Result<(), FinishError> {
        if let Some(code) = self.stop_reason {
            return Err(FinishError::Stopped(code));
        }
        match self.state {
            SendState::Ready => {
                self.state = SendState::DataSent { fin_acked: false };
                self.fin_pending = true;
                Ok(())
            }
            // Idempotent
            SendState::DataSent { .. } => Ok(()),
            SendState::ResetSent => Err(FinishError::ClosedStream),
        }
    }

    /// Abandon transmission; returns the final offset for the RST_STREAM
    pub(super) fn reset(&mut self) -> Option<u64> {
        match self.state {
            SendState::Ready | SendState::DataSent { .. } => {
                self.state = SendState::ResetSent;
                self.fin_pending = false;
                Some(self.pending.offset())
            }
            SendState::ResetSent => None,
        }
    }

    /// Handle STOP_SENDING; true if this is the first stop
    pub(super) fn try_stop(&mut self, error_code: u64) -> bool {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(error_code);
            true
        } else {
            false
        }
    }

    /// Record delivery of a previously sent frame; returns whether the
    /// stream is now fully delivered
    pub(super) fn ack(&mut self, meta: &StreamMeta) -> bool {
        self.pending.ack(meta.offsets.clone());
        match self.state {
            SendState::DataSent { ref mut fin_acked } => {
                *fin_acked |= meta.fin;
                *fin_acked && self.pending.is_fully_acked()
            }
            _ => false,
        }
    }

    /// Queue a lost frame's range for retransmission under its original
    /// offsets
    pub(super) fn retransmit(&mut self, meta: &StreamMeta) {
        if self.state == SendState::ResetSent {
            return;
        }
        if !meta.offsets.is_empty() {
            self.pending.retransmit(meta.offsets.clone());
        }
        if meta.fin {
            self.fin_pending = true;
        }
    }

    pub(super) fn is_pending(&self) -> bool {
        self.state != SendState::ResetSent
            && (self.pending.has_unsent_data() || self.fin_pending)
    }

    pub(super) fn is_finished(&self) -> bool {
        matches!(self.state, SendState::DataSent { fin_acked: true }) || self.state == SendState::ResetSent
    }

    pub(super) fn offset(&self) -> u64 {
        self.pending.offset()
    }

    fn buffered(&self) -> usize {
        self.pending.buffered()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendState {
    /// Accepting new data
    Ready,
    /// Finished; retransmits only until the FIN is acknowledged
    DataSent { fin_acked: bool },
    /// Sent RST_STREAM
    ResetSent,
}

/// Errors triggered while writing to a stream
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum WriteError {
    /// The send buffer is full; retry once in-flight data is acknowledged
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream
    #[error("stopped by peer: code {0}")]
    Stopped(u64),
    /// The stream was finished, reset, or never opened
    #[error("closed stream")]
    ClosedStream,
}

/// Reasons why finishing a stream might fail
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FinishError {
    /// The peer is no longer accepting data on this stream
    #[error("stopped by peer: code {0}")]
    Stopped(u64),
    /// The stream was reset or never opened
    #[error("closed stream")]
    ClosedStream,
}

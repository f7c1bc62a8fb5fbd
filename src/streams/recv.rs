use thiserror::Error;
use tracing::debug;

use crate::{
    assembler::Assembler,
    frame,
    transport_error::TransportError,
};

/// The receive half of a stream
#[derive(Debug, Default)]
pub(crate) struct Recv {
    state: RecvState,
    pub(super) assembler: Assembler,
    /// Highest end offset seen from the peer
    pub(super) end: u64,
    /// Whether the application gave up on reading
    pub(super) stopped: bool,
}

impl Recv {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Buffer a STREAM frame, enforcing the final-size rules
    pub(super) fn ingest(&mut self, frame: frame::Stream) -> Result<(), TransportError> {
        let end = frame.offset + frame.data.len() as u64;

        if let Some(final_size) = self.final_size() {
            if end > final_size || (frame.fin && end != final_size) {
                debug!(end, final_size, "stream data past the final size");
                return Err(TransportError::STREAM_DATA_AFTER_TERMINATION(format!(
                    "frame ends at {} but the stream ended at {}",
                    end, final_size
                )));
            }
        }

        if frame.fin {
            if let RecvState::Recv { ref mut size } = self.state {
                *size = Some(end);
            }
        }

        self.end = self.end.max(end);
        if !self.stopped {
            self.assembler.insert(frame.offset, frame.data);
        } else {
            self.assembler.skip_to(end);
        }
        Ok(())
    }

    /// Copy ordered bytes into `buf`
    pub(super) fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.stopped {
            return Err(ReadError::UnknownStream);
        }
        if let RecvState::ResetRecvd { error_code, .. } = self.state {
            self.state = RecvState::Closed;
            return Err(ReadError::Reset(error_code));
        }

        let mut read = 0;
        while read < buf.len() {
            match self.assembler.read(buf.len() - read) {
                Some(chunk) => {
                    buf[read..read + chunk.bytes.len()].copy_from_slice(&chunk.bytes);
                    read += chunk.bytes.len();
                }
                None => break,
            }
        }
        if read > 0 {
            return Ok(read);
        }

        match self.state {
            RecvState::Recv { size: Some(size) } if self.assembler.bytes_read() == size => {
                self.state = RecvState::Closed;
                Err(ReadError::Finished)
            }
            RecvState::Closed => Err(ReadError::Finished),
            _ => Err(ReadError::Blocked),
        }
    }

    /// Handle RST_STREAM; `Ok(false)` if it was redundant
    pub(super) fn reset(
        &mut self,
        error_code: u64,
        final_offset: u64,
    ) -> Result<bool, TransportError> {
        if let Some(size) = self.final_size() {
            if size != final_offset {
                return Err(TransportError::STREAM_DATA_AFTER_TERMINATION(
                    "reset final offset disagrees with the stream's final size",
                ));
            }
        }
        if self.end > final_offset {
            return Err(TransportError::STREAM_DATA_AFTER_TERMINATION(
                "reset final offset below data already received",
            ));
        }
        if matches!(self.state, RecvState::ResetRecvd { .. } | RecvState::Closed) {
            return Ok(false);
        }
        self.end = final_offset;
        self.state = RecvState::ResetRecvd {
            size: final_offset,
            error_code,
        };
        // Buffered data will never be delivered
        self.assembler.clear();
        Ok(true)
    }

    /// The application cancels reading; unread data stops counting
    pub(super) fn stop(&mut self) {
        self.stopped = true;
        self.assembler.clear();
        self.assembler.skip_to(self.end);
    }

    /// Whether a read would make progress (data, FIN, or reset to report)
    pub(super) fn is_readable(&self) -> bool {
        if self.stopped {
            return false;
        }
        match self.state {
            RecvState::ResetRecvd { .. } => true,
            RecvState::Recv { size } => {
                self.assembler.has_readable()
                    || size.map_or(false, |s| self.assembler.bytes_read() == s)
            }
            RecvState::Closed => false,
        }
    }

    /// No more data will arrive from the peer
    pub(super) fn is_finished(&self) -> bool {
        match self.state {
            RecvState::Recv { size } => {
                size.map_or(false, |s| self.assembler.bytes_read() == s)
            }
            _ => true,
        }
    }

    /// All data delivered or abandoned
    pub(super) fn is_closed(&self) -> bool {
        self.stopped
            || matches!(self.state, RecvState::Closed)
            || matches!(self.state, RecvState::Recv { size: Some(s) } if self.assembler.bytes_read() == s)
    }

    pub(super) fn bytes_read(&self) -> u64 {
        self.assembler.bytes_read()
    }

    fn final_size(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => Some(self.end),
        }
    }
}

/// Errors triggered when reading from a stream
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum ReadError {
    /// No data is currently available; more may arrive
    #[error("blocked")]
    Blocked,
    /// The end of the stream was reached
    #[error("finished")]
    Finished,
    /// The peer abandoned the stream
    #[error("reset by peer: code {0}")]
    Reset(u64),
    /// The stream was never opened, or reading was already cancelled
    #[error("unknown stream")]
    UnknownStream,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvState {
    Recv { size: Option<u64> },
    ResetRecvd { size: u64, error_code: u64 },
    Closed,
}

impl Default for RecvState {
    fn default() -> Self {
        RecvState::Recv { size: None }
    }
}

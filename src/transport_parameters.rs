use std::time::Duration;

use bytes::{Buf, Bytes};

use crate::{
    crypto::{tags, HandshakeMessage},
    transport_error::TransportError,
};

/// Values exchanged during the handshake that govern the connection
///
/// Each side advertises its own receive windows, stream cap, and idle
/// timeout; the effective idle timeout is the minimum of both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransportParameters {
    /// Initial per-stream flow control window offered to the peer
    pub(crate) stream_receive_window: u64,
    /// Initial connection-level flow control window offered to the peer
    pub(crate) connection_receive_window: u64,
    /// How many of our streams the peer may have open at once
    pub(crate) max_incoming_streams: u32,
    pub(crate) idle_timeout: Duration,
    /// Whether the peer may omit the connection ID on packets it sends us
    pub(crate) omit_connection_id: bool,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            stream_receive_window: 32 * 1024,
            connection_receive_window: 48 * 1024,
            max_incoming_streams: 100,
            idle_timeout: Duration::from_secs(30),
            omit_connection_id: false,
        }
    }
}

impl TransportParameters {
    pub(crate) fn write(&self, msg: &mut HandshakeMessage) {
        msg.push(tags::SFCW, u32_value(self.stream_receive_window));
        msg.push(tags::CFCW, u32_value(self.connection_receive_window));
        msg.push(tags::MSPC, Bytes::copy_from_slice(&self.max_incoming_streams.to_le_bytes()));
        msg.push(
            tags::ICSL,
            Bytes::copy_from_slice(&(self.idle_timeout.as_secs() as u32).to_le_bytes()),
        );
        if self.omit_connection_id {
            msg.push(tags::TCID, Bytes::copy_from_slice(&0u32.to_le_bytes()));
        }
    }

    pub(crate) fn read(msg: &HandshakeMessage) -> Result<Self, TransportError> {
        Ok(Self {
            stream_receive_window: u64::from(read_u32(msg, tags::SFCW)?),
            connection_receive_window: u64::from(read_u32(msg, tags::CFCW)?),
            max_incoming_streams: read_u32(msg, tags::MSPC)?,
            idle_timeout: Duration::from_secs(u64::from(read_u32(msg, tags::ICSL)?)),
            omit_connection_id: msg.get(tags::TCID).map_or(false, |v| {
                v.len() == 4 && u32::from_le_bytes([v[0], v[1], v[2], v[3]]) == 0
            }),
        })
    }
}

fn u32_value(x: u64) -> Bytes {
    // Windows above 4 GiB saturate the 32-bit wire form
    let x = x.min(u64::from(u32::MAX)) as u32;
    Bytes::copy_from_slice(&x.to_le_bytes())
}

fn read_u32(msg: &HandshakeMessage, tag: [u8; 4]) -> Result<u32, TransportError> {
    let mut value = msg.get(tag).ok_or_else(|| {
        TransportError::INVALID_CRYPTO_MESSAGE_TYPE(format!(
            "missing {} parameter",
            String::from_utf8_lossy(&tag)
        ))
    })?;
    if value.len() != 4 {
        return Err(TransportError::INVALID_CRYPTO_MESSAGE_TYPE(
            "malformed transport parameter",
        ));
    }
    Ok(value.get_u32_le())
}

//! A sans-IO QUIC endpoint core.
//!
//! This crate contains no networking code. An [`Endpoint`] consumes UDP
//! datagrams handed to it by the caller and routes them to [`Connection`]
//! state machines, which are in turn driven by polling: incoming datagrams
//! and timer expirations go in, packets to transmit and application-facing
//! events come out. Wiring the polls to sockets, tasks, and blocking stream
//! APIs is the job of a layer above this crate.

use std::{fmt, ops};

use bytes::{Buf, BufMut};

mod assembler;
mod coding;
mod flow_control;
mod packer;
mod range_set;
mod send_buffer;
mod spaces;
mod timer;
mod transport_parameters;
mod unpacker;
mod varint;

#[cfg(test)]
mod tests;

mod connection;
pub use crate::connection::{ConnState, Connection, ConnectionError, ConnectionEvent, Event};

mod crypto;
pub use crate::crypto::{
    CookieCallback, CryptoConfig, CryptoProvider, NullCryptoConfig, PresharedCryptoConfig,
    SessionOpts, SourceAddressToken, TokenDecodeError, TokenKey,
};

mod endpoint;
pub use crate::endpoint::{
    BufferPool, Config, ConfigError, ConnectionHandle, DatagramEvent, Endpoint, PacketBuffer,
    Transmit,
};

mod frame;
pub use crate::frame::ConnectionClose;

mod packet;
pub use crate::packet::ConnectionId;

mod streams;
pub use crate::streams::{FinishError, ReadError, WriteError};

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, TransportError};

mod version;
pub use crate::version::VersionNumber;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub(crate) fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub(crate) fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// The security state of a packet, determining which keys protect it
///
/// Levels are strictly ordered. A connection starts out `Unencrypted`,
/// reaches `Secure` when the first handshake-derived keys are installed (the
/// server's packets at this level carry a diversification nonce), and
/// finishes at `ForwardSecure` once the handshake completes. Protocols that
/// name these spaces Initial / Handshake / 1-RTT map onto the same three
/// slots.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    /// No handshake-derived keys; integrity only
    Unencrypted = 0,
    /// Keys derived from the handshake, not yet forward-secure
    Secure = 1,
    /// Final keys
    ForwardSecure = 2,
}

impl EncryptionLevel {
    pub(crate) fn iter() -> impl Iterator<Item = Self> {
        [
            EncryptionLevel::Unencrypted,
            EncryptionLevel::Secure,
            EncryptionLevel::ForwardSecure,
        ]
        .into_iter()
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            EncryptionLevel::Unencrypted => "unencrypted",
            EncryptionLevel::Secure => "secure",
            EncryptionLevel::ForwardSecure => "forward-secure",
        };
        f.write_str(x)
    }
}

/// Identifier for a stream within a particular connection
///
/// Odd identifiers belong to client-initiated streams, even ones to
/// server-initiated streams. The lowest identifiers are reserved: stream 1
/// carries handshake data and stream 3 is reserved for a header stream, so
/// neither can be opened by the application.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 1 == 1 {
            Side::Client
        } else {
            Side::Server
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} stream {}", initiator, self.0)
    }
}

impl From<StreamId> for u64 {
    fn from(x: StreamId) -> u64 {
        x.0
    }
}

impl coding::Codec for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<StreamId> {
        Ok(StreamId(varint::read(buf).ok_or(coding::UnexpectedEnd)?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        varint::write(self.0, buf);
    }
}

/// Reserved stream carrying handshake bytes; exempt from flow control
pub(crate) const CRYPTO_STREAM_ID: StreamId = StreamId(1);
/// Reserved for a header-compression stream layered above this crate
pub(crate) const HEADERS_STREAM_ID: StreamId = StreamId(3);

//
// Useful internal constants
//

/// Maximum UDP payload: 1500 byte ethernet MTU minus 40 byte IPv6 and 8 byte
/// UDP headers
pub(crate) const MAX_PACKET_SIZE: usize = 1452;
/// Minimum payload size the server accepts for a first client flight
pub(crate) const MIN_CLIENT_HELLO_SIZE: usize = 1024;
/// Number of client hellos a client will send before giving up
pub(crate) const MAX_CLIENT_HELLOS: u32 = 3;
pub(crate) const MAX_CID_SIZE: usize = 18;
pub(crate) const MIN_CID_SIZE: usize = 4;
/// Length of a connection ID in the legacy public header
pub(crate) const PUBLIC_HEADER_CID_SIZE: usize = 8;
pub(crate) const TIMER_GRANULARITY: std::time::Duration = std::time::Duration::from_millis(1);

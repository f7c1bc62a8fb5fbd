use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    version::VersionNumber,
    Side, MAX_CID_SIZE, MIN_CID_SIZE, PUBLIC_HEADER_CID_SIZE,
};

// Public flags of the legacy header. Bits 2-3 signal the diversification
// nonce and bits 4-5 the connection ID length; only one value of each pair is
// ever produced (nonce present, 8-byte ID) but any nonzero value is accepted.
const VERSION_FLAG: u8 = 0x01;
const RESET_FLAG: u8 = 0x02;
const NONCE_FLAG: u8 = 0x04;
const CID_MASK: u8 = 0x30;
const PN_LEN_MASK: u8 = 0xc0;

/// Marks the IETF long header form; never set in a legacy public header
/// because packet number lengths stop at 6 bytes (bits 6-7 < 0b11... the
/// 6-byte encoding uses 0b11, so the disambiguator is the low bit context:
/// legacy parsing is only attempted for the negotiated legacy versions).
pub(crate) const LONG_HEADER_FORM: u8 = 0x80;

const KEY_PHASE_BIT: u8 = 0x40;
/// Fixed bits 3-5 of an IETF short header
const SHORT_HEADER_MARKER: u8 = 0x30;

pub(crate) type DiversificationNonce = [u8; 32];

/// Protocol-level identifier for a connection
///
/// An opaque byte string of length 0 or 4 to 18; equality is byte equality.
/// Clients choose one when dialing and regenerate it when version
/// negotiation restarts the handshake.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(
            bytes.is_empty() || (bytes.len() >= MIN_CID_SIZE && bytes.len() <= MAX_CID_SIZE)
        );
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: rand::Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A parsed packet header
///
/// `Public` is the legacy form used by the negotiated versions; the IETF
/// long and short forms are carried by the codec for version-negotiation
/// interop and future versions that frame packets that way.
#[derive(Debug, Clone)]
pub(crate) enum Header {
    Public {
        /// Absent when connection ID omission was negotiated
        dst_cid: Option<ConnectionId>,
        /// Set by clients before the connection is forward-secure
        version: Option<VersionNumber>,
        /// Set by servers on secure (not yet forward-secure) packets
        nonce: Option<DiversificationNonce>,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: u32,
    },
    Short {
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    /// Server response listing supported versions; `legacy` selects the
    /// public-header encoding with version tags over the IETF form
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: Option<ConnectionId>,
        versions: Vec<VersionNumber>,
        legacy: bool,
    },
    PublicReset {
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub(crate) fn encode<W: BufMut>(&self, w: &mut W) {
        use self::Header::*;
        match *self {
            Public {
                ref dst_cid,
                version,
                ref nonce,
                number,
            } => {
                let mut flags = number.public_flags();
                if version.is_some() {
                    flags |= VERSION_FLAG;
                }
                if nonce.is_some() {
                    flags |= NONCE_FLAG;
                }
                if dst_cid.is_some() {
                    flags |= CID_MASK;
                }
                w.write(flags);
                if let Some(cid) = dst_cid {
                    w.put_slice(cid);
                }
                if let Some(v) = version {
                    w.put_u32_le(v.tag());
                }
                if let Some(nonce) = nonce {
                    w.put_slice(nonce);
                }
                number.encode(w);
            }
            Long {
                ty,
                version,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(LONG_HEADER_FORM | ty as u8);
                w.write(version);
                w.write(encode_cid_lengths(dst_cid, src_cid));
                w.put_slice(dst_cid);
                w.put_slice(src_cid);
                w.write(number);
            }
            Short {
                key_phase,
                ref dst_cid,
                number,
            } => {
                let mut first = SHORT_HEADER_MARKER;
                if key_phase {
                    first |= KEY_PHASE_BIT;
                }
                first |= match number.len() {
                    1 => 0x0,
                    2 => 0x1,
                    4 => 0x2,
                    _ => panic!("short headers carry 1, 2, or 4 byte packet numbers"),
                };
                w.write(first);
                w.put_slice(dst_cid);
                number.encode(w);
            }
            VersionNegotiate {
                ref dst_cid,
                ref src_cid,
                ref versions,
                legacy,
            } => {
                if legacy {
                    w.write(VERSION_FLAG | CID_MASK);
                    w.put_slice(dst_cid);
                    for v in versions {
                        w.put_u32_le(v.tag());
                    }
                } else {
                    w.write(LONG_HEADER_FORM | (rand::random::<u8>() & !LONG_HEADER_FORM));
                    w.write::<u32>(0);
                    let src = src_cid.as_ref().unwrap_or(dst_cid);
                    w.write(encode_cid_lengths(dst_cid, src));
                    w.put_slice(dst_cid);
                    w.put_slice(src);
                    for v in versions {
                        w.write(v.0 as u32);
                    }
                }
            }
            PublicReset { ref dst_cid } => {
                w.write(RESET_FLAG | CID_MASK);
                w.put_slice(dst_cid);
                w.put_slice(b"PRST");
            }
        }
    }

    /// Parse a header from the start of a datagram
    ///
    /// `sent_by` disambiguates the version flag of the public form: a flag
    /// set by a server marks a version negotiation packet, one set by a
    /// client accompanies a version tag. Version-negotiation payloads are
    /// consumed entirely; for all other forms the buffer is left positioned
    /// at the start of the packet payload.
    pub(crate) fn decode<B: Buf>(buf: &mut B, sent_by: Side) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM != 0 {
            return Self::decode_long_form(buf, first);
        }

        if first & RESET_FLAG != 0 {
            let dst_cid = decode_cid(buf, PUBLIC_HEADER_CID_SIZE)?;
            return Ok(Header::PublicReset { dst_cid });
        }

        let dst_cid = match first & CID_MASK {
            0 => None,
            CID_MASK => Some(decode_cid(buf, PUBLIC_HEADER_CID_SIZE)?),
            _ => return Err(PacketDecodeError::InvalidHeader("bad connection ID length bits")),
        };

        let mut version = None;
        if first & VERSION_FLAG != 0 {
            if sent_by.is_server() {
                // A version flag from the server announces version negotiation
                let dst_cid = dst_cid
                    .ok_or(PacketDecodeError::InvalidHeader("negotiation without connection ID"))?;
                if buf.remaining() == 0 || buf.remaining() % 4 != 0 {
                    return Err(PacketDecodeError::InvalidVersionNegotiation);
                }
                let mut versions = Vec::with_capacity(buf.remaining() / 4);
                while buf.has_remaining() {
                    versions.push(VersionNumber::from_tag(buf.get_u32_le()));
                }
                return Ok(Header::VersionNegotiate {
                    dst_cid,
                    src_cid: None,
                    versions,
                    legacy: true,
                });
            }
            if buf.remaining() < 4 {
                return Err(PacketDecodeError::InvalidHeader("truncated version tag"));
            }
            version = Some(VersionNumber::from_tag(buf.get_u32_le()));
        }

        let nonce = if first & (NONCE_FLAG | 0x08) != 0 {
            let mut nonce = [0; 32];
            if buf.remaining() < 32 {
                return Err(PacketDecodeError::InvalidHeader("truncated diversification nonce"));
            }
            buf.copy_to_slice(&mut nonce);
            Some(nonce)
        } else {
            None
        };

        let number = PacketNumber::decode(
            match (first & PN_LEN_MASK) >> 6 {
                0b00 => 1,
                0b01 => 2,
                0b10 => 4,
                _ => 6,
            },
            buf,
        )?;

        Ok(Header::Public {
            dst_cid,
            version,
            nonce,
            number,
        })
    }

    fn decode_long_form<B: Buf>(buf: &mut B, first: u8) -> Result<Self, PacketDecodeError> {
        let version = buf.get::<u32>()?;
        let lengths = buf.get::<u8>()?;
        let dst_cid = decode_cid(buf, decode_cid_length(lengths >> 4))?;
        let src_cid = decode_cid(buf, decode_cid_length(lengths & 0xf))?;

        if version == 0 {
            if buf.remaining() == 0 || buf.remaining() % 4 != 0 {
                return Err(PacketDecodeError::InvalidVersionNegotiation);
            }
            let mut versions = Vec::with_capacity(buf.remaining() / 4);
            while buf.has_remaining() {
                versions.push(VersionNumber(buf.get::<u32>()? as i32));
            }
            return Ok(Header::VersionNegotiate {
                dst_cid,
                src_cid: Some(src_cid),
                versions,
                legacy: false,
            });
        }

        let ty = LongType::from_byte(first & !LONG_HEADER_FORM)?;
        let number = buf.get::<u32>()?;
        Ok(Header::Long {
            ty,
            version,
            dst_cid,
            src_cid,
            number,
        })
    }

    /// Parse an IETF short header; callers select this form by negotiated
    /// version, since the first byte alone cannot distinguish it from the
    /// legacy public form
    pub(crate) fn decode_short<B: Buf>(buf: &mut B) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & 0x38 != SHORT_HEADER_MARKER {
            return Err(PacketDecodeError::InvalidHeader("invalid short header marker bits"));
        }
        let dst_cid = decode_cid(buf, PUBLIC_HEADER_CID_SIZE)?;
        let len = match first & 0x3 {
            0x0 => 1,
            0x1 => 2,
            0x2 => 4,
            _ => return Err(PacketDecodeError::InvalidHeader("invalid short header packet number bits")),
        };
        let number = PacketNumber::decode(len, buf)?;
        Ok(Header::Short {
            key_phase: first & KEY_PHASE_BIT != 0,
            dst_cid,
            number,
        })
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        match *self {
            Public { number, .. } => Some(number),
            Short { number, .. } => Some(number),
            Long { number, .. } => Some(PacketNumber::U32(number)),
            _ => None,
        }
    }

    pub(crate) fn dst_cid(&self) -> Option<ConnectionId> {
        use self::Header::*;
        match *self {
            Public { dst_cid, .. } => dst_cid,
            Long { dst_cid, .. } => Some(dst_cid),
            Short { dst_cid, .. } => Some(dst_cid),
            VersionNegotiate { dst_cid, .. } => Some(dst_cid),
            PublicReset { dst_cid } => Some(dst_cid),
        }
    }

    pub(crate) fn diversification_nonce(&self) -> Option<&DiversificationNonce> {
        match self {
            Header::Public { nonce, .. } => nonce.as_ref(),
            _ => None,
        }
    }
}

/// A packet split into its authenticated-but-unprotected parts
pub(crate) struct Packet {
    pub(crate) header: Header,
    /// Raw header bytes, the associated data for packet protection
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    /// Decode one datagram; the legacy forms carry no length field, so a
    /// datagram is exactly one packet
    pub(crate) fn decode(data: BytesMut, sent_by: Side) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(data);
        let header = Header::decode(&mut buf, sent_by)?;
        Self::split(buf, header)
    }

    /// Decode a datagram whose first byte marks an IETF short header; the
    /// caller selects this by negotiated version
    pub(crate) fn decode_short(data: BytesMut) -> Result<Self, PacketDecodeError> {
        let mut buf = io::Cursor::new(data);
        let header = Header::decode_short(&mut buf)?;
        Self::split(buf, header)
    }

    fn split(buf: io::Cursor<BytesMut>, header: Header) -> Result<Self, PacketDecodeError> {
        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        let header_data = bytes.split_to(header_len).freeze();
        Ok(Self {
            header,
            header_data,
            payload: bytes,
        })
    }
}

/// An encoded packet number
///
/// Truncated on the wire to 1, 2, 4, or 6 bytes; receivers reconstruct the
/// full value from the highest number seen in the same space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U32(u32),
    U48(u64),
}

impl PacketNumber {
    /// Truncate `n` for a header, given the lowest packet the peer may still
    /// be waiting to acknowledge
    ///
    /// Headers never use the 1-byte form: the delta to the least unacked
    /// packet can grow by a full flight between packing and delivery.
    pub(crate) fn for_header(n: u64, least_unacked: u64) -> Self {
        let diff = n.saturating_sub(least_unacked);
        if diff < 1 << 15 {
            PacketNumber::U16(n as u16)
        } else if diff < 1 << 31 {
            PacketNumber::U32(n as u32)
        } else {
            PacketNumber::U48(n & 0xffff_ffff_ffff)
        }
    }

    pub(crate) fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U32(_) => 4,
            U48(_) => 6,
        }
    }

    fn public_flags(self) -> u8 {
        use self::PacketNumber::*;
        match self {
            U8(_) => 0b00 << 6,
            U16(_) => 0b01 << 6,
            U32(_) => 0b10 << 6,
            U48(_) => 0b11 << 6,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U32(x) => w.write(x),
            U48(x) => w.put_uint(x, 6),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use self::PacketNumber::*;
        Ok(match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            4 => U32(r.get()?),
            6 => {
                if r.remaining() < 6 {
                    return Err(PacketDecodeError::InvalidHeader("truncated packet number"));
                }
                U48(r.get_uint(6))
            }
            _ => unreachable!(),
        })
    }

    /// Reconstruct the full packet number closest to `expected`
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U32(x) => u64::from(x),
            U48(x) => x,
        };
        let nbits = self.len() * 8;
        if nbits == 64 {
            return truncated;
        }
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // A candidate is formed from the expected high bits and the truncated
        // low bits, then shifted by one window if it lands outside
        // (expected - hwin, expected + hwin].
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// IETF long header packet types
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Initial = 0x02,
    Retry = 0x03,
    Handshake = 0x04,
    ZeroRtt = 0x06,
}

impl LongType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use self::LongType::*;
        Ok(match b {
            0x02 => Initial,
            0x03 => Retry,
            0x04 => Handshake,
            0x06 => ZeroRtt,
            _ => return Err(PacketDecodeError::InvalidHeader("unknown long header type")),
        })
    }
}

fn decode_cid(buf: &mut impl Buf, len: usize) -> Result<ConnectionId, PacketDecodeError> {
    if len > MAX_CID_SIZE {
        return Err(PacketDecodeError::InvalidHeader("illegal connection ID length"));
    }
    if buf.remaining() < len {
        return Err(PacketDecodeError::InvalidHeader("connection ID longer than packet"));
    }
    let cid = ConnectionId::new(&buf.chunk()[..len]);
    buf.advance(len);
    Ok(cid)
}

/// Pack the two connection ID lengths into one byte; zero means absent,
/// otherwise the field stores the length minus three
fn encode_cid_lengths(dst: &ConnectionId, src: &ConnectionId) -> u8 {
    encode_cid_length(dst) << 4 | encode_cid_length(src)
}

fn encode_cid_length(id: &ConnectionId) -> u8 {
    if id.is_empty() {
        0
    } else {
        debug_assert!(id.len() >= MIN_CID_SIZE);
        (id.len() - 3) as u8
    }
}

fn decode_cid_length(enc: u8) -> usize {
    if enc == 0 {
        0
    } else {
        enc as usize + 3
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    #[error("invalid version negotiation packet")]
    InvalidVersionNegotiation,
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

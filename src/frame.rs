use std::{
    fmt::{self, Write},
    io,
    ops::{Range, RangeInclusive},
};

use bytes::{Buf, BufMut, Bytes};
use tinyvec::TinyVec;

use crate::{
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    range_set::RangeSet,
    transport_error::{Code as ErrorCode, TransportError},
    varint, StreamId,
};

/// A frame type identifier
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    STOP_WAITING = 0x03,
    RST_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    // STREAM (0x08..=0x0f)
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    BLOCKED = 0x14,
    STREAM_BLOCKED = 0x15,
    CONNECTION_CLOSE = 0x1c,
}

const STREAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x08, 0x0f);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    /// Tells the peer to stop acknowledging packets below `least_unacked`
    StopWaiting { least_unacked: u64 },
    RstStream(RstStream),
    StopSending { id: StreamId, error_code: u64 },
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    Blocked { offset: u64 },
    StreamBlocked { id: StreamId, offset: u64 },
    Close(ConnectionClose),
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        use self::Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(_) => FrameType::ACK,
            StopWaiting { .. } => FrameType::STOP_WAITING,
            RstStream(_) => FrameType::RST_STREAM,
            StopSending { .. } => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken { .. } => FrameType::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start();
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                FrameType(ty)
            }
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            Blocked { .. } => FrameType::BLOCKED,
            StreamBlocked { .. } => FrameType::STREAM_BLOCKED,
            Close(_) => FrameType::CONNECTION_CLOSE,
        }
    }

    /// Whether the frame obliges the receiver to send an acknowledgement
    ///
    /// ACK and STOP_WAITING are regenerated from current state rather than
    /// retransmitted, and neither elicits an acknowledgement of its own.
    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(
            *self,
            Self::Ack(_) | Self::StopWaiting { .. } | Self::Padding | Self::Close(_)
        )
    }

    /// Serialized size, exact for every variant except ACK and CLOSE, whose
    /// encoders bound themselves
    pub(crate) fn size(&self) -> usize {
        use self::Frame::*;
        match *self {
            Padding | Ping => 1,
            Ack(_) => unreachable!("ACK frames are sized by their encoder"),
            StopWaiting { .. } => 1 + 8,
            RstStream(ref x) => 1 + varint::size(x.id.0) + varint::size(x.error_code) + varint::size(x.final_offset),
            StopSending { id, error_code } => 1 + varint::size(id.0) + varint::size(error_code),
            Crypto(ref x) => 1 + varint::size(x.offset) + varint::size(x.data.len() as u64) + x.data.len(),
            NewToken { ref token } => 1 + varint::size(token.len() as u64) + token.len(),
            Stream(ref x) => {
                1 + varint::size(x.id.0)
                    + if x.offset != 0 { varint::size(x.offset) } else { 0 }
                    + varint::size(x.data.len() as u64)
                    + x.data.len()
            }
            MaxData(x) => 1 + varint::size(x),
            MaxStreamData { id, offset } => 1 + varint::size(id.0) + varint::size(offset),
            Blocked { offset } => 1 + varint::size(offset),
            StreamBlocked { id, offset } => 1 + varint::size(id.0) + varint::size(offset),
            Close(ref x) => 1 + 4 + varint::size(x.reason.len() as u64) + x.reason.len(),
        }
    }

    /// Write a control frame
    ///
    /// STREAM and ACK frames are produced by their own encoders, which need
    /// context this method does not have.
    pub(crate) fn encode<W: BufMut>(&self, packet_number: u64, out: &mut W) {
        use self::Frame::*;
        match *self {
            Padding => out.write(FrameType::PADDING),
            Ping => out.write(FrameType::PING),
            StopWaiting { least_unacked } => {
                out.write(FrameType::STOP_WAITING);
                debug_assert!(least_unacked <= packet_number);
                out.write_var(packet_number.saturating_sub(least_unacked));
            }
            RstStream(ref x) => x.encode(out),
            StopSending { id, error_code } => {
                out.write(FrameType::STOP_SENDING);
                out.write(id);
                out.write_var(error_code);
            }
            Crypto(ref x) => x.encode(out),
            NewToken { ref token } => {
                out.write(FrameType::NEW_TOKEN);
                out.write_var(token.len() as u64);
                out.put_slice(token);
            }
            MaxData(x) => {
                out.write(FrameType::MAX_DATA);
                out.write_var(x);
            }
            MaxStreamData { id, offset } => {
                out.write(FrameType::MAX_STREAM_DATA);
                out.write(id);
                out.write_var(offset);
            }
            Blocked { offset } => {
                out.write(FrameType::BLOCKED);
                out.write_var(offset);
            }
            StreamBlocked { id, offset } => {
                out.write(FrameType::STREAM_BLOCKED);
                out.write(id);
                out.write_var(offset);
            }
            Close(ref x) => x.encode(out, usize::MAX),
            Ack(_) | Stream(_) => unreachable!("sized frames use their own encoders"),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub(crate) largest: u64,
    /// Time the peer sat on its largest acknowledged packet, in microseconds
    pub(crate) delay: u64,
    /// Encoded ACK blocks, walked by [`AckIter`]
    pub(crate) additional: Bytes,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges = "[".to_string();
        let mut first = true;
        for range in self.iter() {
            if !first {
                ranges.push(',');
            }
            write!(ranges, "{range:?}")?;
            first = false;
        }
        ranges.push(']');

        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ranges", &ranges)
            .finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        AckIter::new(self.largest, &self.additional[..])
    }
}

impl Ack {
    /// Write an ACK covering `ranges`, which must be non-empty
    pub(crate) fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        let mut rest = ranges.iter().rev();
        let first = rest.next().unwrap();
        let largest = first.end - 1;
        let first_size = first.end - first.start;
        buf.write(FrameType::ACK);
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first_size - 1);
        let mut prev = first.start;
        for block in rest {
            let size = block.end - block.start;
            buf.write_var(prev - block.end - 1);
            buf.write_var(size - 1);
            prev = block.start;
        }
    }

    pub(crate) fn iter(&self) -> AckIter<'_> {
        self.into_iter()
    }
}

/// Walks the ranges of an ACK frame from newest to oldest
pub(crate) struct AckIter<'a> {
    largest: u64,
    data: io::Cursor<&'a [u8]>,
}

impl<'a> AckIter<'a> {
    fn new(largest: u64, payload: &'a [u8]) -> Self {
        Self {
            largest,
            data: io::Cursor::new(payload),
        }
    }
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;
    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        if !self.data.has_remaining() {
            return None;
        }
        let block = self.data.get_var().unwrap();
        let largest = self.largest;
        if let Ok(gap) = self.data.get_var() {
            self.largest -= block + gap + 2;
        }
        Some(largest - block..=largest)
    }
}

/// Validate the ACK block section and return its length in bytes
fn scan_ack_blocks(buf: &[u8], largest: u64, n: usize) -> Result<usize, IterErr> {
    let mut read = io::Cursor::new(buf);
    let first_block = read.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
    let mut smallest = largest.checked_sub(first_block).ok_or(IterErr::Malformed)?;
    for _ in 0..n {
        let gap = read.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
        smallest = smallest.checked_sub(gap + 2).ok_or(IterErr::Malformed)?;
        let block = read.get_var().map_err(|_| IterErr::UnexpectedEnd)?;
        smallest = smallest.checked_sub(block).ok_or(IterErr::Malformed)?;
    }
    Ok(read.position() as usize)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RstStream {
    pub(crate) id: StreamId,
    pub(crate) error_code: u64,
    /// Total number of bytes the sender had committed to this stream
    pub(crate) final_offset: u64,
}

impl RstStream {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::RST_STREAM);
        out.write(self.id);
        out.write_var(self.error_code);
        out.write_var(self.final_offset);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    /// Frame type plus worst-case offset and length varints
    pub(crate) const SIZE_BOUND: usize = 17;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) offset: u64,
    pub(crate) fin: bool,
    pub(crate) data: Bytes,
}

/// Metadata from a stream frame
///
/// The data itself stays in the stream's send buffer; packets record only
/// which byte ranges they carried.
#[derive(Debug, Clone)]
pub(crate) struct StreamMeta {
    pub(crate) id: StreamId,
    pub(crate) offsets: Range<u64>,
    pub(crate) fin: bool,
}

// `Default` exists only so `TinyVec` can hold this
impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            id: StreamId(0),
            offsets: 0..0,
            fin: false,
        }
    }
}

impl StreamMeta {
    /// Largest possible encoding: type, 8-byte id, offset, and length
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8 + 8;

    /// `length` may be false only for the final frame of a packet, which is
    /// bounded by the packet instead and saves the length bytes
    pub(crate) fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = *STREAM_TYS.start();
        if self.offsets.start != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write_var(ty);
        out.write(self.id);
        if self.offsets.start != 0 {
            out.write_var(self.offsets.start);
        }
        if length {
            out.write_var(self.offsets.end - self.offsets.start);
        }
    }
}

/// A vector of [`StreamMeta`] optimized for the single-frame case
pub(crate) type StreamMetaVec = TinyVec<[StreamMeta; 1]>;

/// Reason carried in a CONNECTION_CLOSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded on the wire
    pub error_code: ErrorCode,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            reason: x.reason.into(),
        }
    }
}

impl ConnectionClose {
    /// Frame type, error code, and worst-case reason length varint
    pub(crate) const SIZE_BOUND: usize = 1 + 4 + 8;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::CONNECTION_CLOSE);
        out.write(self.error_code);
        let max_reason = max_len.saturating_sub(Self::SIZE_BOUND);
        let actual_len = self.reason.len().min(max_reason);
        out.write_var(actual_len as u64);
        out.put_slice(&self.reason[0..actual_len]);
    }
}

/// Decodes the frames of a packet payload in wire order
pub(crate) struct Iter {
    bytes: Bytes,
    packet_number: u64,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes, packet_number: u64) -> Self {
        Self {
            bytes: payload,
            packet_number,
            last_ty: None,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK => {
                let largest = self.bytes.get_var()?;
                let delay = self.bytes.get_var()?;
                let extra_blocks = self.bytes.get_var()? as usize;
                let n = scan_ack_blocks(&self.bytes, largest, extra_blocks)?;
                Frame::Ack(Ack {
                    largest,
                    delay,
                    additional: self.bytes.split_to(n),
                })
            }
            FrameType::STOP_WAITING => {
                let delta = self.bytes.get_var()?;
                let least_unacked = self
                    .packet_number
                    .checked_sub(delta)
                    .ok_or(IterErr::Malformed)?;
                Frame::StopWaiting { least_unacked }
            }
            FrameType::RST_STREAM => Frame::RstStream(RstStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get_var()?,
                final_offset: self.bytes.get_var()?,
            }),
            FrameType::STOP_SENDING => Frame::StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get_var()?,
            },
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            FrameType::NEW_TOKEN => Frame::NewToken {
                token: self.take_len()?,
            },
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::BLOCKED => Frame::Blocked {
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAM_BLOCKED => Frame::StreamBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::CONNECTION_CLOSE => Frame::Close(ConnectionClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            }),
            _ => match ty.stream() {
                Some(s) => Frame::Stream(Stream {
                    id: self.bytes.get()?,
                    offset: if s.off() { self.bytes.get_var()? } else { 0 },
                    fin: s.fin(),
                    data: if s.len() {
                        self.take_len()?
                    } else {
                        self.bytes.split_off(0)
                    },
                }),
                None => return Err(IterErr::InvalidFrameId),
            },
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, TransportError>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // A partial or malformed frame poisons the rest of the packet
                self.bytes.clear();
                Some(Err(TransportError::INVALID_FRAME_DATA(match self.last_ty {
                    Some(ty) => format!("in frame of type {ty}: {}", e.reason()),
                    None => e.reason().to_string(),
                })))
            }
        }
    }
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl IterErr {
    fn reason(&self) -> &'static str {
        use self::IterErr::*;
        match self {
            UnexpectedEnd => "unexpected end",
            InvalidFrameId => "unknown frame type",
            Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        IterErr::UnexpectedEnd
    }
}

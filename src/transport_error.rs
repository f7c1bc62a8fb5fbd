use std::fmt;

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt};

/// Transport-level errors occur when a peer violates the protocol specification
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportError {
    /// Type of error
    pub code: Code,
    /// Human-readable explanation of the reason for the error
    pub reason: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

impl From<Code> for TransportError {
    fn from(code: Code) -> Self {
        Self {
            code,
            reason: String::new(),
        }
    }
}

/// Transport-level error code carried in CONNECTION_CLOSE frames
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Code(u32);

impl coding::Codec for Code {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Code(buf.get()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write::<u32>(self.0)
    }
}

impl From<Code> for u32 {
    fn from(x: Code) -> u32 {
        x.0
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(
                #[doc = $desc]
                #[allow(non_snake_case, unused)]
                pub(crate) fn $name<T>(reason: T) -> Self where T: Into<String> {
                    Self {
                        code: Code::$name,
                        reason: reason.into(),
                    }
                }
            )*
        }

        impl Code {
            $(#[doc = $desc] pub const $name: Self = Code($val);)*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x => write!(f, "Code({:02x})", x),
                }
            }
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let x = match self.0 {
                    $($val => $desc,)*
                    _ => "unknown error",
                };
                f.write_str(x)
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue";
    STREAM_DATA_AFTER_TERMINATION(0x2) "stream data was received after the stream's final size was established";
    INVALID_PACKET_HEADER(0x3) "a packet header was malformed";
    INVALID_FRAME_DATA(0x4) "a frame could not be decoded from a packet payload";
    INVALID_ACK_DATA(0x9) "an ACK frame referenced packets that were never sent or was not monotonically decreasing";
    INVALID_VERSION_NEGOTIATION_PACKET(0xa) "a version negotiation packet was malformed";
    DECRYPTION_FAILURE(0xc) "a packet failed authenticated decryption";
    PACKET_TOO_LARGE(0xe) "a packet exceeded the maximum packet size";
    PEER_GOING_AWAY(0x10) "the peer is going away";
    INVALID_STREAM_ID(0x11) "a frame referenced an invalid stream identifier";
    TOO_MANY_OPEN_STREAMS(0x12) "the peer opened more streams than permitted";
    INVALID_VERSION(0x14) "the negotiated version is invalid or disagreed with version negotiation";
    NETWORK_IDLE_TIMEOUT(0x19) "no activity was observed within the idle timeout";
    INVALID_CRYPTO_MESSAGE_TYPE(0x21) "a handshake message had an unknown type tag";
    MISSING_PAYLOAD(0x30) "a packet decrypted to an empty payload";
    INVALID_HEADERS_STREAM_DATA(0x38) "data on the reserved headers stream was malformed";
    FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA(0x3b) "the peer sent more data than its advertised flow control window allows";
    HANDSHAKE_TIMEOUT(0x43) "the cryptographic handshake did not complete in time";
    HANDSHAKE_FAILED(0x47) "the cryptographic handshake failed";
}

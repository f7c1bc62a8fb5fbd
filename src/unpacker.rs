use bytes::{Bytes, BytesMut};

use crate::{
    crypto::CryptoProvider,
    packet::{Header, Packet, LONG_HEADER_FORM},
    transport_error::TransportError,
    version::VersionNumber,
    EncryptionLevel, Side,
};

/// One successfully unprotected packet, ready for frame dispatch
pub(crate) struct UnpackedPacket {
    pub(crate) number: u64,
    /// The level whose keys opened the packet
    pub(crate) level: EncryptionLevel,
    pub(crate) plaintext: Bytes,
}

/// The datagram turned out to be one of the stateless forms
pub(crate) enum Unpacked {
    Packet(UnpackedPacket),
    VersionNegotiate(Vec<VersionNumber>),
    PublicReset,
}

pub(crate) enum UnpackError {
    /// Not decodable or not openable; drop without prejudice
    Discard(&'static str),
    /// The packet authenticated but its contents violate the protocol
    Fatal(TransportError),
}

/// Parse a datagram's header, strip packet protection at whichever level
/// opens it, and hand back the plaintext
///
/// `largest_rx` seeds the truncated packet number expansion. Versions that
/// frame with IETF headers parse the short form for non-long first bytes;
/// the legacy public form applies otherwise.
pub(crate) fn unpack(
    crypto: &mut dyn CryptoProvider,
    sent_by: Side,
    version: VersionNumber,
    largest_rx: u64,
    data: BytesMut,
) -> Result<Unpacked, UnpackError> {
    let ietf_short = version.uses_ietf_header()
        && data.first().map_or(false, |&b| b & LONG_HEADER_FORM == 0);
    let packet = if ietf_short {
        Packet::decode_short(data)
    } else {
        Packet::decode(data, sent_by)
    }
    .map_err(|_| UnpackError::Discard("malformed header"))?;

    match packet.header {
        Header::VersionNegotiate { ref versions, .. } => {
            return Ok(Unpacked::VersionNegotiate(versions.clone()));
        }
        Header::PublicReset { .. } => return Ok(Unpacked::PublicReset),
        _ => {}
    }

    let number = match packet.header.number() {
        Some(truncated) => truncated.expand(largest_rx),
        None => return Err(UnpackError::Discard("packet without a number")),
    };

    let (plaintext, level) = crypto
        .open(
            number,
            &packet.header_data,
            &packet.payload,
            packet.header.diversification_nonce(),
        )
        .map_err(|_| UnpackError::Discard("no key opened the packet"))?;

    if plaintext.is_empty() {
        return Err(UnpackError::Fatal(TransportError::MISSING_PAYLOAD("")));
    }

    Ok(Unpacked::Packet(UnpackedPacket {
        number,
        level,
        plaintext: Bytes::from(plaintext),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{CryptoConfig, NullCryptoConfig, SessionOpts},
        packet::{ConnectionId, PacketNumber},
        transport_error::Code,
        transport_parameters::TransportParameters,
    };
    use std::net::{Ipv6Addr, SocketAddr};

    fn provider() -> Box<dyn CryptoProvider> {
        NullCryptoConfig.start_session(
            Side::Server,
            SessionOpts {
                server_name: None,
                params: TransportParameters::default(),
                remote: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433),
                version: VersionNumber(36),
                token_key: None,
                accept_cookie: None,
            },
        )
    }

    fn sealed_packet(payload: &[u8]) -> BytesMut {
        let header = Header::Public {
            dst_cid: Some(ConnectionId::new(&[1; 8])),
            version: None,
            nonce: None,
            number: PacketNumber::U16(7),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let sealed = crate::crypto::null_seal(&buf, payload);
        buf.extend_from_slice(&sealed);
        BytesMut::from(&buf[..])
    }

    #[test]
    fn unpacks_sealed_payload() {
        let mut crypto = provider();
        let data = sealed_packet(b"frames go here");
        match unpack(&mut *crypto, Side::Client, VersionNumber(36), 0, data) {
            Ok(Unpacked::Packet(p)) => {
                assert_eq!(p.number, 7);
                assert_eq!(&p.plaintext[..], b"frames go here");
            }
            _ => panic!("expected a packet"),
        }
    }

    #[test]
    fn empty_payload_is_fatal() {
        let mut crypto = provider();
        let data = sealed_packet(b"");
        match unpack(&mut *crypto, Side::Client, VersionNumber(36), 0, data) {
            Err(UnpackError::Fatal(e)) => assert_eq!(e.code, Code::MISSING_PAYLOAD),
            _ => panic!("expected a fatal error"),
        }
    }

    #[test]
    fn tampered_packet_is_discarded() {
        let mut crypto = provider();
        let mut data = sealed_packet(b"frames go here");
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(matches!(
            unpack(&mut *crypto, Side::Client, VersionNumber(36), 0, data),
            Err(UnpackError::Discard(_))
        ));
    }
}

use std::time::Duration;

use assert_matches::assert_matches;
use bytes::BytesMut;

use crate::{
    crypto::null_seal,
    frame::StreamMeta,
    packet::{ConnectionId, Header, PacketNumber},
    transport_error::Code,
    Config, ConnState, Connection, ConnectionError, ConnectionHandle, DatagramEvent, Endpoint,
    Event, PresharedCryptoConfig, ReadError, StreamId, Transmit, TransportErrorCode,
    VersionNumber, WriteError,
};

mod util;
use util::*;

use std::sync::Arc;

#[test]
fn handshake_completes() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let client_events = drain_events(pair.client_conn_mut(client_ch));
    assert!(client_events
        .iter()
        .any(|e| matches!(e, Event::Connected)));
    let states = client_events
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        states,
        vec![
            ConnState::VersionNegotiated,
            ConnState::Secure,
            ConnState::ForwardSecure,
        ]
    );

    let server_events = drain_events(pair.server_conn_mut(server_ch));
    assert!(server_events
        .iter()
        .any(|e| matches!(e, Event::Connected)));
    assert!(!pair.client_conn_mut(client_ch).is_handshaking());
    assert!(!pair.server_conn_mut(server_ch).is_handshaking());
}

#[test]
fn transfer_both_directions() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let to_server = pair.client_conn_mut(client_ch).open_stream().unwrap();
    assert_eq!(
        pair.client_conn_mut(client_ch)
            .write(to_server, b"ping from client")
            .unwrap(),
        16
    );
    pair.client_conn_mut(client_ch).finish(to_server).unwrap();
    pair.drive();

    drain_events(pair.server_conn_mut(server_ch));
    let accepted = pair.server_conn_mut(server_ch).accept_stream().unwrap();
    assert_eq!(accepted, to_server);
    let (data, end) = read_to_end(pair.server_conn_mut(server_ch), accepted);
    assert_eq!(data, b"ping from client");
    assert_eq!(end, ReadError::Finished);

    // And the other way
    let to_client = pair.server_conn_mut(server_ch).open_stream().unwrap();
    pair.server_conn_mut(server_ch)
        .write(to_client, b"pong from server")
        .unwrap();
    pair.server_conn_mut(server_ch).finish(to_client).unwrap();
    pair.drive();

    let accepted = pair.client_conn_mut(client_ch).accept_stream().unwrap();
    let (data, end) = read_to_end(pair.client_conn_mut(client_ch), accepted);
    assert_eq!(data, b"pong from server");
    assert_eq!(end, ReadError::Finished);

    // The client's FIN was delivered and acknowledged along the way
    let client_events = drain_events(pair.client_conn_mut(client_ch));
    assert!(client_events
        .iter()
        .any(|e| matches!(e, Event::StreamFinished(id) if *id == to_server)));
}

#[test]
fn version_negotiation_downgrade() {
    subscribe();
    let server_config = Config {
        versions: vec![VersionNumber(35)],
        ..Default::default()
    };
    let mut pair = Pair::new(Config::default(), server_config);

    let (client_ch, conn) = pair
        .client
        .endpoint
        .connect(pair.time, pair.server.addr, "localhost");
    pair.client.connections.insert(client_ch, conn);
    let initial_cid = pair.client_conn_mut(client_ch).connection_id();
    assert_eq!(pair.client_conn_mut(client_ch).version(), VersionNumber(36));

    pair.drive();

    // The client regenerated its connection ID and switched to 35, and the
    // handshake completed without a user-visible error
    let conn = pair.client_conn_mut(client_ch);
    assert_eq!(conn.version(), VersionNumber(35));
    assert_ne!(conn.connection_id(), initial_cid);
    let events = drain_events(conn);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::StateChanged(ConnState::VersionNegotiated))));
    assert!(events.iter().any(|e| matches!(e, Event::Connected)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost(_))));

    let server_ch = *pair.server.accepted.last().unwrap();
    assert_eq!(pair.server_conn_mut(server_ch).version(), VersionNumber(35));
}

#[test]
fn version_negotiation_offering_current_version_is_ignored() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, conn) = pair
        .client
        .endpoint
        .connect(pair.time, pair.server.addr, "localhost");
    pair.client.connections.insert(client_ch, conn);
    let initial_cid = pair.client_conn_mut(client_ch).connection_id();
    pair.drive_client();

    // A forged negotiation packet that lists the version we offered
    let mut forged = Vec::new();
    Header::VersionNegotiate {
        dst_cid: initial_cid,
        src_cid: None,
        versions: vec![VersionNumber(34), VersionNumber(36)],
        legacy: true,
    }
    .encode(&mut forged);
    let server_addr = pair.server.addr;
    pair.client
        .inbound
        .push_back((pair.time, server_addr, BytesMut::from(&forged[..])));

    pair.drive();

    // The packet was treated as an attack: same version, same ID, connected
    let conn = pair.client_conn_mut(client_ch);
    assert_eq!(conn.version(), VersionNumber(36));
    assert_eq!(conn.connection_id(), initial_cid);
    let events = drain_events(conn);
    assert!(events.iter().any(|e| matches!(e, Event::Connected)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost(_))));
}

fn craft_stream_packet(
    cid: ConnectionId,
    number: u16,
    id: u64,
    offset: u64,
    data: &[u8],
    fin: bool,
) -> BytesMut {
    let header = Header::Public {
        dst_cid: Some(cid),
        version: None,
        nonce: None,
        number: PacketNumber::U16(number),
    };
    let mut buf = Vec::new();
    header.encode(&mut buf);
    let header_len = buf.len();
    let mut payload = Vec::new();
    StreamMeta {
        id: StreamId(id),
        offsets: offset..offset + data.len() as u64,
        fin,
    }
    .encode(true, &mut payload);
    payload.extend_from_slice(data);
    let sealed = null_seal(&buf[..header_len], &payload);
    buf.extend_from_slice(&sealed);
    BytesMut::from(&buf[..])
}

#[test]
fn flow_control_violation_closes_connection() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();
    let cid = pair.client_conn_mut(client_ch).connection_id();
    drain_events(pair.server_conn_mut(server_ch));

    // One byte past the advertised stream receive window
    let window = Config::default().stream_receive_window;
    let packet = craft_stream_packet(cid, 1000, 5, window, b"x", false);
    let client_addr = pair.client.addr;
    pair.server.inbound.push_back((pair.time, client_addr, packet));
    pair.drive();

    let events = drain_events(pair.server_conn_mut(server_ch));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost(ConnectionError::TransportError(err))
            if err.code == Code::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA
    )));

    // The close frame reached the client
    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost(ConnectionError::ConnectionClosed(close))
            if close.error_code == Code::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA
    )));
}

#[test]
fn reordered_stream_frames_read_in_order() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();
    let cid = pair.client_conn_mut(client_ch).connection_id();
    let client_addr = pair.client.addr;

    let later = craft_stream_packet(cid, 1000, 5, 3, b"bar", false);
    let earlier = craft_stream_packet(cid, 1001, 5, 0, b"foo", false);
    pair.server.inbound.push_back((pair.time, client_addr, later));
    pair.server.inbound.push_back((pair.time, client_addr, earlier));
    // Feed the server alone; the spoofed numbers must not reach the real
    // client's ACK validation
    let time = pair.time;
    pair.server.drive(time);

    let server = pair.server_conn_mut(server_ch);
    assert_eq!(server.accept_stream(), Some(StreamId(5)));
    let mut buf = [0; 16];
    let n = server.read(StreamId(5), &mut buf).unwrap();
    assert_eq!(&buf[..n], b"foobar");
    assert_matches!(server.read(StreamId(5), &mut buf), Err(ReadError::Blocked));
}

#[test]
fn close_with_pending_data_carries_fin() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    // Data and close before anything is transmitted
    let id = pair.client_conn_mut(client_ch).open_stream().unwrap();
    pair.client_conn_mut(client_ch).write(id, b"foobar").unwrap();
    pair.client_conn_mut(client_ch).finish(id).unwrap();
    pair.drive();

    let server = pair.server_conn_mut(server_ch);
    assert_eq!(server.accept_stream(), Some(id));
    let (data, end) = read_to_end(server, id);
    assert_eq!(data, b"foobar");
    assert_eq!(end, ReadError::Finished);

    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::StreamFinished(x) if *x == id)));
    // Nothing further to send for this stream
    assert_matches!(
        pair.client_conn_mut(client_ch).write(id, b"more"),
        Err(WriteError::ClosedStream)
    );
}

#[test]
fn lost_packet_is_retransmitted_with_new_number() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let id = pair.client_conn_mut(client_ch).open_stream().unwrap();
    pair.client_conn_mut(client_ch)
        .write(id, b"worth repeating")
        .unwrap();
    pair.client_conn_mut(client_ch).finish(id).unwrap();

    // The first flight vanishes
    pair.client.drop_outbound = 1;
    pair.drive();

    assert!(pair.client_conn_mut(client_ch).lost_packet_count() >= 1);
    // The loss cost us congestion window
    assert!(pair.client_conn_mut(client_ch).congestion_window() < 10 * 1452);
    let server = pair.server_conn_mut(server_ch);
    assert_eq!(server.accept_stream(), Some(id));
    let (data, end) = read_to_end(server, id);
    // Exactly one copy arrived, in order
    assert_eq!(data, b"worth repeating");
    assert_eq!(end, ReadError::Finished);
}

#[test]
fn stop_sending_resets_the_stream() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let id = pair.client_conn_mut(client_ch).open_stream().unwrap();
    pair.client_conn_mut(client_ch)
        .write(id, b"unwanted")
        .unwrap();
    pair.drive();

    // The server's application cancels reading
    drain_events(pair.server_conn_mut(server_ch));
    let _ = pair.server_conn_mut(server_ch).accept_stream();
    pair.server_conn_mut(server_ch).stop_sending(id, 42);
    pair.drive();

    // The client's send half is dead with the peer's code, and the server
    // observed the answering reset
    assert_matches!(
        pair.client_conn_mut(client_ch).write(id, b"more"),
        Err(WriteError::Stopped(42))
    );
    let mut buf = [0; 8];
    assert_matches!(
        pair.server_conn_mut(server_ch).read(id, &mut buf),
        Err(ReadError::UnknownStream) | Err(ReadError::Reset(42))
    );
}

#[test]
fn local_close_reaches_peer() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let time = pair.time;
    pair.client_conn_mut(client_ch)
        .close(time, TransportErrorCode::PEER_GOING_AWAY, "done here");
    pair.drive();

    let events = drain_events(pair.server_conn_mut(server_ch));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ConnectionLost(ConnectionError::ConnectionClosed(close))
            if close.error_code == Code::PEER_GOING_AWAY
    )));
    assert!(pair.client_conn_mut(client_ch).is_closed());
}

#[test]
fn idle_timeout_fires() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, _server_ch) = pair.connect();
    drain_events(pair.client_conn_mut(client_ch));

    pair.advance(Duration::from_secs(31));
    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost(ConnectionError::TimedOut))));
}

#[test]
fn keep_alive_defeats_idle_timeout() {
    subscribe();
    let client_config = Config {
        keep_alive: true,
        ..Default::default()
    };
    let mut pair = Pair::new(client_config, Config::default());
    let (client_ch, server_ch) = pair.connect();
    drain_events(pair.client_conn_mut(client_ch));
    drain_events(pair.server_conn_mut(server_ch));

    for _ in 0..4 {
        pair.advance(Duration::from_secs(20));
    }
    assert!(!drain_events(pair.client_conn_mut(client_ch))
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost(_))));
    assert!(!drain_events(pair.server_conn_mut(server_ch))
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost(_))));
}

#[test]
fn handshake_timeout_fires() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, conn) = pair
        .client
        .endpoint
        .connect(pair.time, pair.server.addr, "localhost");
    pair.client.connections.insert(client_ch, conn);
    // The network eats everything the client sends
    pair.client.drop_outbound = usize::MAX;

    pair.advance(Duration::from_secs(11));
    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::ConnectionLost(ConnectionError::HandshakeTimeout))));
}

#[test]
fn preshared_crypto_end_to_end() {
    subscribe();
    let secret = [0x5c; 32];
    let config = || Config {
        crypto: Arc::new(PresharedCryptoConfig::new(secret)),
        ..Default::default()
    };
    let mut pair = Pair::new(config(), config());
    let (client_ch, server_ch) = pair.connect();

    let id = pair.client_conn_mut(client_ch).open_stream().unwrap();
    pair.client_conn_mut(client_ch)
        .write(id, b"over real keys")
        .unwrap();
    pair.client_conn_mut(client_ch).finish(id).unwrap();
    pair.drive();

    let server = pair.server_conn_mut(server_ch);
    assert_eq!(server.accept_stream(), Some(id));
    let (data, end) = read_to_end(server, id);
    assert_eq!(data, b"over real keys");
    assert_eq!(end, ReadError::Finished);
}

#[test]
fn large_transfer_exercises_flow_control() {
    subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    // Several times both the stream and connection windows
    let total: usize = 96 * 1024;
    let chunk = vec![0x42u8; 8192];
    let mut written = 0;
    let id = pair.client_conn_mut(client_ch).open_stream().unwrap();

    let mut received = Vec::new();
    let mut accepted = false;
    for _ in 0..200 {
        while written < total {
            let take = chunk.len().min(total - written);
            match pair.client_conn_mut(client_ch).write(id, &chunk[..take]) {
                Ok(n) => written += n,
                Err(WriteError::Blocked) => break,
                Err(e) => panic!("write failed: {e}"),
            }
        }
        if written == total {
            pair.client_conn_mut(client_ch).finish(id).ok();
        }
        pair.drive();
        let server = pair.server_conn_mut(server_ch);
        if !accepted {
            accepted = server.accept_stream().is_some();
        }
        if accepted {
            let mut buf = [0; 4096];
            loop {
                match server.read(id, &mut buf) {
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(ReadError::Blocked) => break,
                    Err(ReadError::Finished) => {
                        assert_eq!(received.len(), total);
                        assert!(received.iter().all(|&b| b == 0x42));
                        return;
                    }
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        }
    }
    panic!(
        "transfer did not complete: wrote {written}, received {}",
        received.len()
    );
}

#[test]
fn server_stream_cap_respected() {
    subscribe();
    let server_config = Config {
        max_incoming_streams: 2,
        ..Default::default()
    };
    let mut pair = Pair::new(Config::default(), server_config);
    let (client_ch, server_ch) = pair.connect();

    // The cap travelled to the client in the server's parameters
    let client = pair.client_conn_mut(client_ch);
    let a = client.open_stream().unwrap();
    let b = client.open_stream().unwrap();
    assert_eq!(client.open_stream(), None);

    client.write(a, b"one").unwrap();
    client.write(b, b"two").unwrap();
    pair.drive();
    let server = pair.server_conn_mut(server_ch);
    assert!(server.accept_stream().is_some());
    assert!(server.accept_stream().is_some());
    assert!(server.accept_stream().is_none());
}

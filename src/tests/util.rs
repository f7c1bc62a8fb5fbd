use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv6Addr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tracing::{info_span, trace};

use super::*;

static NEXT_PORT: AtomicU16 = AtomicU16::new(4433);

fn local_addr() -> SocketAddr {
    SocketAddr::new(
        Ipv6Addr::LOCALHOST.into(),
        NEXT_PORT.fetch_add(1, Ordering::Relaxed),
    )
}

pub(super) fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "error".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A client and server endpoint wired back to back through an in-memory
/// lossless (unless told otherwise) network with a virtual clock
pub(super) struct Pair {
    pub(super) server: TestEndpoint,
    pub(super) client: TestEndpoint,
    pub(super) time: Instant,
    /// One-way delivery delay
    pub(super) latency: Duration,
}

impl Pair {
    pub(super) fn new(client_config: Config, server_config: Config) -> Self {
        Self {
            server: TestEndpoint::new(Endpoint::new(server_config, true).unwrap(), local_addr()),
            client: TestEndpoint::new(Endpoint::new(client_config, false).unwrap(), local_addr()),
            time: Instant::now(),
            latency: Duration::ZERO,
        }
    }

    /// Run one simulation step; false once the network is quiescent
    pub(super) fn step(&mut self) -> bool {
        self.drive_client();
        self.drive_server();
        if self.client.is_idle() && self.server.is_idle() {
            return false;
        }
        let next = min_opt(self.client.next_wakeup(), self.server.next_wakeup());
        if let Some(t) = next {
            if t > self.time {
                trace!(?t, "advancing virtual clock");
                self.time = t;
            }
        }
        true
    }

    /// Step until both sides go quiescent
    pub(super) fn drive(&mut self) {
        for _ in 0..1000 {
            if !self.step() {
                return;
            }
        }
        panic!("simulation did not go quiescent");
    }

    /// Jump the clock forward, then let timers fire
    pub(super) fn advance(&mut self, d: Duration) {
        self.time += d;
        self.drive();
    }

    pub(super) fn drive_client(&mut self) {
        let span = info_span!("client");
        let _guard = span.enter();
        self.client.drive(self.time);
        let outbound = self.client.outbound.drain(..).collect::<Vec<_>>();
        for x in outbound {
            if self.client.drop_outbound > 0 {
                self.client.drop_outbound -= 1;
                trace!("dropping client datagram");
                continue;
            }
            if x.destination == self.server.addr {
                self.server.inbound.push_back((
                    self.time + self.latency,
                    self.client.addr,
                    BytesMut::from(&x.contents[..]),
                ));
            }
        }
    }

    pub(super) fn drive_server(&mut self) {
        let span = info_span!("server");
        let _guard = span.enter();
        self.server.drive(self.time);
        let outbound = self.server.outbound.drain(..).collect::<Vec<_>>();
        for x in outbound {
            if self.server.drop_outbound > 0 {
                self.server.drop_outbound -= 1;
                trace!("dropping server datagram");
                continue;
            }
            if x.destination == self.client.addr {
                self.client.inbound.push_back((
                    self.time + self.latency,
                    self.server.addr,
                    BytesMut::from(&x.contents[..]),
                ));
            }
        }
    }

    /// Dial and drive both sides until the handshake completes
    pub(super) fn connect(&mut self) -> (ConnectionHandle, ConnectionHandle) {
        let (client_ch, conn) = self
            .client
            .endpoint
            .connect(self.time, self.server.addr, "localhost");
        self.client.connections.insert(client_ch, conn);
        self.drive();
        let server_ch = *self.server.accepted.last().expect("server accepted a connection");
        (client_ch, server_ch)
    }

    pub(super) fn client_conn_mut(&mut self, ch: ConnectionHandle) -> &mut Connection {
        self.client.connections.get_mut(&ch).unwrap()
    }

    pub(super) fn server_conn_mut(&mut self, ch: ConnectionHandle) -> &mut Connection {
        self.server.connections.get_mut(&ch).unwrap()
    }
}

impl Default for Pair {
    fn default() -> Self {
        Pair::new(Config::default(), Config::default())
    }
}

pub(super) struct TestEndpoint {
    pub(super) endpoint: Endpoint,
    pub(super) addr: SocketAddr,
    pub(super) connections: HashMap<ConnectionHandle, Connection>,
    /// (arrival time, sender, datagram)
    pub(super) inbound: VecDeque<(Instant, SocketAddr, BytesMut)>,
    pub(super) outbound: VecDeque<Transmit>,
    /// Connections accepted from peers, in order
    pub(super) accepted: Vec<ConnectionHandle>,
    /// Datagrams to drop before delivery, for loss injection
    pub(super) drop_outbound: usize,
}

impl TestEndpoint {
    fn new(endpoint: Endpoint, addr: SocketAddr) -> Self {
        Self {
            endpoint,
            addr,
            connections: HashMap::new(),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            accepted: Vec::new(),
            drop_outbound: 0,
        }
    }

    pub(super) fn drive(&mut self, now: Instant) {
        while let Some(&(arrival, _, _)) = self.inbound.front() {
            if arrival > now {
                break;
            }
            let (_, remote, data) = self.inbound.pop_front().unwrap();
            match self.endpoint.handle(now, remote, data) {
                Some((ch, DatagramEvent::ConnectionEvent(event))) => {
                    if let Some(conn) = self.connections.get_mut(&ch) {
                        conn.handle_event(event);
                    }
                }
                Some((ch, DatagramEvent::NewConnection(conn))) => {
                    self.connections.insert(ch, conn);
                    self.accepted.push(ch);
                }
                None => {}
            }
        }

        let handles = self.connections.keys().copied().collect::<Vec<_>>();
        for ch in handles {
            let conn = self.connections.get_mut(&ch).unwrap();
            conn.handle_timeout(now);
            while let Some(transmit) = conn.poll_transmit(now) {
                self.outbound.push_back(transmit);
            }
            while let Some(event) = conn.poll_endpoint_events() {
                self.endpoint.handle_event(now, ch, event);
            }
        }
        while let Some(transmit) = self.endpoint.poll_transmit() {
            self.outbound.push_back(transmit);
        }
    }

    fn is_idle(&mut self) -> bool {
        self.inbound.is_empty()
            && self.outbound.is_empty()
            && self
                .connections
                .values_mut()
                .all(|c| c.next_urgent_timeout().is_none())
    }

    fn next_wakeup(&mut self) -> Option<Instant> {
        let timer = self
            .connections
            .values_mut()
            .filter_map(|c| c.next_urgent_timeout())
            .min();
        let arrival = self.inbound.front().map(|&(t, _, _)| t);
        min_opt(timer, arrival)
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Drain every queued application event from a connection
pub(super) fn drain_events(conn: &mut Connection) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll() {
        events.push(event);
    }
    events
}

/// Read a stream to completion, returning its bytes
pub(super) fn read_to_end(conn: &mut Connection, id: StreamId) -> (Vec<u8>, ReadError) {
    let mut out = Vec::new();
    let mut buf = [0; 4096];
    loop {
        match conn.read(id, &mut buf) {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => return (out, e),
        }
    }
}

use std::{
    fmt, io,
    net::SocketAddr,
    ops::Deref,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rand::{rngs::StdRng, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ConnectionEvent, ConnectionEventInner},
    crypto::{CookieCallback, CryptoConfig, NullCryptoConfig, TokenKey},
    packet::{ConnectionId, Header},
    streams::StreamsConfig,
    transport_parameters::TransportParameters,
    version::{VersionNumber, SUPPORTED_VERSIONS},
    Side, MAX_PACKET_SIZE, MIN_CLIENT_HELLO_SIZE, PUBLIC_HEADER_CID_SIZE,
};

/// How long a closed connection's ID keeps absorbing late packets
const CLOSED_SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(60);

/// Multiplexes connections over a shared datagram socket
///
/// Performs no I/O: the caller reads datagrams and feeds them to
/// [`handle`](Self::handle), writes out whatever
/// [`poll_transmit`](Self::poll_transmit) yields, and owns the
/// [`Connection`] state machines this endpoint routes to.
pub struct Endpoint {
    rng: StdRng,
    config: Arc<Config>,
    token_key: Option<Arc<TokenKey>>,
    server: bool,
    transmits: std::collections::VecDeque<Transmit>,
    connection_ids: FxHashMap<ConnectionId, ConnectionHandle>,
    /// Fallback routing for packets without a connection ID
    connection_remotes: FxHashMap<SocketAddr, ConnectionHandle>,
    connections: Slab<ConnectionMeta>,
    /// Recently closed connection IDs, absorbing stragglers
    closed: FxHashMap<ConnectionId, Instant>,
    pool: Arc<BufferPool>,
}

impl Endpoint {
    /// Create an endpoint; `server` endpoints accept incoming connections
    pub fn new(config: Config, server: bool) -> Result<Self, ConfigError> {
        config.validate()?;
        let token_key = server.then(|| Arc::new(TokenKey::new(&config.token_secret)));
        Ok(Self {
            rng: StdRng::from_entropy(),
            config: Arc::new(config),
            token_key,
            server,
            transmits: Default::default(),
            connection_ids: FxHashMap::default(),
            connection_remotes: FxHashMap::default(),
            connections: Slab::new(),
            closed: FxHashMap::default(),
            pool: Arc::new(BufferPool::new()),
        })
    }

    /// Queued outgoing datagrams (version negotiation, resets)
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Process one incoming datagram
    ///
    /// Either routes it to an existing connection, creates a new one
    /// (servers), or consumes it (version negotiation, resets, stragglers).
    pub fn handle(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        data: BytesMut,
    ) -> Option<(ConnectionHandle, DatagramEvent)> {
        self.closed
            .retain(|_, closed_at| now.saturating_duration_since(*closed_at) < CLOSED_SESSION_DELETE_TIMEOUT);

        let sent_by = if self.server { Side::Client } else { Side::Server };
        let header = match Header::decode(&mut io::Cursor::new(&data[..]), sent_by) {
            Ok(x) => x,
            Err(e) => {
                trace!(%remote, "dropping undecodable datagram: {e}");
                return None;
            }
        };

        let dst_cid = header.dst_cid();
        if let Some(cid) = dst_cid {
            if self.closed.contains_key(&cid) {
                trace!(%cid, "absorbing packet for a closed connection");
                return None;
            }
        }

        let ch = dst_cid
            .and_then(|cid| self.connection_ids.get(&cid))
            .or_else(|| self.connection_remotes.get(&remote))
            .copied();
        if let Some(ch) = ch {
            return Some((
                ch,
                DatagramEvent::ConnectionEvent(ConnectionEvent(ConnectionEventInner::Datagram {
                    now,
                    remote,
                    data,
                })),
            ));
        }

        if !self.server {
            debug!(%remote, "dropping packet for unknown client connection");
            return None;
        }
        self.handle_first_packet(now, remote, header, data)
    }

    fn handle_first_packet(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        header: Header,
        data: BytesMut,
    ) -> Option<(ConnectionHandle, DatagramEvent)> {
        let (cid, version) = match header {
            Header::Public {
                dst_cid: Some(cid),
                version: Some(version),
                ..
            } => (cid, version),
            Header::Public { dst_cid: Some(cid), version: None, .. }
            | Header::Short { dst_cid: cid, .. } => {
                // Never answer something smaller than the reset would be,
                // or resets could feed on each other
                if data.len() > 64 {
                    self.maybe_send_public_reset(remote, cid);
                }
                return None;
            }
            _ => {
                trace!(%remote, "dropping unroutable packet");
                return None;
            }
        };

        if data.len() < MIN_CLIENT_HELLO_SIZE {
            // Tiny packets must not be able to elicit anything, version
            // negotiation included
            debug!(len = data.len(), "ignoring undersized first client packet");
            return None;
        }

        if !self.config.versions.contains(&version) {
            trace!(%version, "sending version negotiation");
            let mut buffer = self.pool.lease();
            Header::VersionNegotiate {
                dst_cid: cid,
                src_cid: None,
                versions: self.config.versions.clone(),
                legacy: true,
            }
            .encode(buffer.as_mut_vec());
            self.transmits.push_back(Transmit {
                destination: remote,
                contents: buffer,
            });
            return None;
        }

        let mut conn = Connection::new(
            self.config.clone(),
            self.token_key.clone(),
            Side::Server,
            version,
            cid,
            remote,
            None,
            self.pool.clone(),
            now,
        );
        conn.handle_event(ConnectionEvent(ConnectionEventInner::Datagram {
            now,
            remote,
            data,
        }));

        let id = self.connections.insert(ConnectionMeta { cid, remote });
        let ch = ConnectionHandle(id);
        self.connection_ids.insert(cid, ch);
        self.connection_remotes.insert(remote, ch);
        trace!(%cid, %remote, "connection incoming");
        Some((ch, DatagramEvent::NewConnection(conn)))
    }

    /// Initiate a connection to `remote`
    pub fn connect(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        server_name: &str,
    ) -> (ConnectionHandle, Connection) {
        let version = *self
            .config
            .versions
            .iter()
            .max()
            .expect("validated config has at least one version");
        let cid = ConnectionId::random(&mut self.rng, PUBLIC_HEADER_CID_SIZE);
        trace!(%cid, %version, "dialing");
        let conn = Connection::new(
            self.config.clone(),
            None,
            Side::Client,
            version,
            cid,
            remote,
            Some(server_name.into()),
            self.pool.clone(),
            now,
        );
        let id = self.connections.insert(ConnectionMeta { cid, remote });
        let ch = ConnectionHandle(id);
        self.connection_ids.insert(cid, ch);
        self.connection_remotes.insert(remote, ch);
        (ch, conn)
    }

    /// Process events a connection emitted for its endpoint
    pub fn handle_event(&mut self, now: Instant, ch: ConnectionHandle, event: EndpointEvent) {
        match event.0 {
            EndpointEventInner::CidChanged(new) => {
                let meta = &mut self.connections[ch.0];
                trace!(old = %meta.cid, %new, "connection ID regenerated");
                self.connection_ids.remove(&meta.cid);
                meta.cid = new;
                self.connection_ids.insert(new, ch);
            }
            EndpointEventInner::Drained => {
                if !self.connections.contains(ch.0) {
                    return;
                }
                let meta = self.connections.remove(ch.0);
                self.connection_ids.remove(&meta.cid);
                self.connection_remotes.remove(&meta.remote);
                self.closed.insert(meta.cid, now);
                trace!(cid = %meta.cid, "connection drained");
            }
        }
    }

    /// Public reset for a routable-looking packet we hold no state for,
    /// enabled by configuring a stateless reset key
    fn maybe_send_public_reset(&mut self, remote: SocketAddr, dst_cid: ConnectionId) {
        if self.config.stateless_reset_key.is_none() {
            return;
        }
        debug!(%dst_cid, %remote, "sending public reset");
        let mut buffer = self.pool.lease();
        Header::PublicReset { dst_cid }.encode(buffer.as_mut_vec());
        if let Some(key) = &self.config.stateless_reset_key {
            // Proof bytes derived from the reset key, so a sibling endpoint
            // sharing the key could validate the reset
            let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
            let tag = ring::hmac::sign(&key, &dst_cid);
            buffer.as_mut_vec().extend_from_slice(&tag.as_ref()[..16]);
        }
        self.transmits.push_back(Transmit {
            destination: remote,
            contents: buffer,
        });
    }

    #[cfg(test)]
    pub(crate) fn known_connections(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("server", &self.server)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ConnectionMeta {
    cid: ConnectionId,
    remote: SocketAddr,
}

/// Identifier for a connection within an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

/// Result of feeding one datagram to [`Endpoint::handle`]
pub enum DatagramEvent {
    /// The datagram belongs to the identified connection
    ConnectionEvent(ConnectionEvent),
    /// The datagram started a new connection, already primed with it
    NewConnection(Connection),
}

/// Events a connection reports back to its endpoint
pub struct EndpointEvent(pub(crate) EndpointEventInner);

#[derive(Debug)]
pub(crate) enum EndpointEventInner {
    /// The connection is gone; leave a tombstone
    Drained,
    /// Version negotiation restarted the handshake under a fresh ID
    CidChanged(ConnectionId),
}

/// A datagram ready to be written to the socket
pub struct Transmit {
    pub destination: SocketAddr,
    pub contents: PacketBuffer,
}

/// Pool of reusable packet buffers shared across an endpoint's connections
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

/// Buffers retained for reuse
const POOL_CAPACITY: usize = 64;

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Borrow a buffer; it returns to the pool when dropped
    pub(crate) fn lease(self: &Arc<Self>) -> PacketBuffer {
        let vec = self
            .buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(MAX_PACKET_SIZE));
        PacketBuffer {
            vec,
            pool: Arc::clone(self),
        }
    }
}

/// A leased packet buffer; dropping it returns the allocation to its pool
pub struct PacketBuffer {
    vec: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PacketBuffer {
    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.vec
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.vec
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let mut vec = std::mem::take(&mut self.vec);
        vec.clear();
        let mut buffers = self.pool.buffers.lock().unwrap();
        if buffers.len() < POOL_CAPACITY {
            buffers.push(vec);
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketBuffer({} bytes)", self.vec.len())
    }
}

/// Parameters governing endpoints and the connections they create
///
/// Fields default to values suitable for testing on loopback; production
/// deployments will want to tune the windows for their bandwidth-delay
/// product.
pub struct Config {
    /// Versions to offer (client preference order is by magnitude) or
    /// accept (server allow-list)
    pub versions: Vec<VersionNumber>,
    /// Source of per-connection crypto sessions
    pub crypto: Arc<dyn CryptoConfig>,
    /// Give up on connections that have not completed the handshake in time
    pub handshake_timeout: Duration,
    /// Close connections after this long without a packet from the peer
    pub idle_timeout: Duration,
    /// Round-trip estimate used before any sample exists
    pub initial_rtt: Duration,
    /// Ask to omit the connection ID on forward-secure packets we send;
    /// the peer must then route us by address
    pub request_connection_id_omission: bool,
    /// Peer-initiated stream cap: `-1` disables, `0` selects the default
    pub max_incoming_streams: i64,
    /// Accepted for configuration compatibility; this protocol family's
    /// streams are all bidirectional, so there is no class to cap
    pub max_incoming_uni_streams: i64,
    /// Send a PING at half the idle timeout to keep the connection alive
    pub keep_alive: bool,
    /// Server acceptance policy for source-address tokens; `None` applies
    /// the default address-match-and-freshness rule
    pub accept_cookie: Option<CookieCallback>,
    /// Secret behind issued source-address tokens
    pub token_secret: [u8; 32],
    /// Enables public resets for unknown-connection packets when set
    pub stateless_reset_key: Option<Vec<u8>>,

    pub stream_receive_window: u64,
    pub max_stream_receive_window: u64,
    pub connection_receive_window: u64,
    pub max_connection_receive_window: u64,
    /// Cap on unacknowledged data buffered per stream
    pub send_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            versions: SUPPORTED_VERSIONS.to_vec(),
            crypto: Arc::new(NullCryptoConfig),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            initial_rtt: Duration::from_millis(100),
            request_connection_id_omission: false,
            max_incoming_streams: 0,
            max_incoming_uni_streams: 0,
            keep_alive: false,
            accept_cookie: None,
            token_secret: rand::random(),
            stateless_reset_key: None,
            stream_receive_window: 32 * 1024,
            max_stream_receive_window: 1024 * 1024,
            connection_receive_window: 48 * 1024,
            max_connection_receive_window: 1536 * 1024,
            send_buffer_size: 1024 * 1024,
        }
    }
}

/// Streams the default cap allows a peer to hold open
const DEFAULT_MAX_INCOMING_STREAMS: u64 = 100;

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.versions.is_empty() {
            return Err(ConfigError::IllegalValue("versions must not be empty"));
        }
        if self.versions.iter().any(|v| !v.is_supported()) {
            return Err(ConfigError::IllegalValue("unimplemented version listed"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::IllegalValue("idle_timeout must be nonzero"));
        }
        if self.stream_receive_window == 0 || self.connection_receive_window == 0 {
            return Err(ConfigError::IllegalValue("receive windows must be nonzero"));
        }
        Ok(())
    }

    pub(crate) fn effective_max_incoming(&self) -> u64 {
        match self.max_incoming_streams {
            n if n < 0 => 0,
            0 => DEFAULT_MAX_INCOMING_STREAMS,
            n => n as u64,
        }
    }

    pub(crate) fn transport_parameters(&self, side: Side) -> TransportParameters {
        TransportParameters {
            stream_receive_window: self.stream_receive_window,
            connection_receive_window: self.connection_receive_window,
            max_incoming_streams: self.effective_max_incoming() as u32,
            idle_timeout: self.idle_timeout,
            omit_connection_id: self.request_connection_id_omission && side.is_client(),
        }
    }

    pub(crate) fn streams_config(&self) -> StreamsConfig {
        StreamsConfig {
            max_incoming: self.effective_max_incoming(),
            stream_receive_window: self.stream_receive_window,
            max_stream_receive_window: self.max_stream_receive_window,
            initial_send_window: TransportParameters::default().stream_receive_window,
            send_buffer_size: self.send_buffer_size,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("versions", &self.versions)
            .field("idle_timeout", &self.idle_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Errors in an endpoint's configuration
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}

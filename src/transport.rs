//! A connectionless UDP channel.
//!
//! One [UdpTransport] serves one [ChannelRole]. A broadcast channel sends
//! frames to a single destination (possibly a broadcast address), a
//! subscribe channel only listens. Setup happens in small steps (bind,
//! connect, enable broadcast, begin receiving), each of which reports its own
//! failure and leaves the decision to retry or give up to the caller.
//!
//! Latency pings travel over the same socket. The transport answers pings
//! and times pongs itself; only audio reaches the receive callback.

use crate::wire::{self, LatencyStamp, Packet, PacketKind};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest payload a UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// How long the receive thread blocks before checking whether it should stop.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

const PING_SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Which half of a conversation a transport serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Send-only, one to many.
    Broadcast,
    /// Receive-only.
    Subscribe,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Broadcast => write!(f, "broadcast"),
            ChannelRole::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Which logical conversation a transport belongs to. The identities are
/// opaque application tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Who we are.
    pub local_id: String,
    /// Who we talk to. Empty on a subscribe binding means anyone.
    pub remote_id: String,
    /// Which direction audio flows.
    pub role: ChannelRole,
}

impl ChannelBinding {
    /// A binding that sends `local_id`'s voice to `remote_id`.
    pub fn broadcast(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            role: ChannelRole::Broadcast,
        }
    }

    /// A binding that listens to `remote_id` on behalf of `local_id`.
    pub fn subscribe(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            role: ChannelRole::Subscribe,
        }
    }

    /// Whether a frame from `sender_id` belongs to this conversation. An
    /// empty remote identity accepts anyone.
    pub fn accepts(&self, sender_id: &str) -> bool {
        self.remote_id.is_empty() || self.remote_id == sender_id
    }
}

/// Where a transport is in its setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No socket yet.
    Unbound,
    /// A socket exists but has neither a destination nor a receive loop.
    Bound,
    /// Sends go to a resolved destination.
    Connected,
    /// The receive thread is running.
    Receiving,
}

/// A setup step that did not work out.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// The address asked for.
        addr: String,
        /// What the OS said.
        source: io::Error,
    },

    /// The destination host has no usable address.
    #[error("cannot resolve {0}")]
    Resolve(String),

    /// `SO_BROADCAST` could not be changed.
    #[error("cannot enable broadcast: {0}")]
    Broadcast(io::Error),

    /// The receive thread could not be started.
    #[error("cannot start receiving: {0}")]
    Receive(io::Error),

    /// The step belongs to the other role.
    #[error("{operation} is not allowed on a {role} channel")]
    RoleMismatch {
        /// The step that was attempted.
        operation: &'static str,
        /// The transport's role.
        role: ChannelRole,
    },

    /// Bind was called twice.
    #[error("already bound to {0}")]
    AlreadyBound(SocketAddr),
}

/// Why a single frame was not delivered. Never retried.
#[derive(Debug, Error)]
pub enum SendError {
    /// Nothing to send to yet.
    #[error("no destination connected")]
    NotConnected,

    /// The socket stayed busy past the deadline.
    #[error("send did not complete in time")]
    Timeout,

    /// The OS took only part of the datagram.
    #[error("only {sent} of {len} bytes were sent")]
    Truncated {
        /// Bytes accepted.
        sent: usize,
        /// Bytes offered.
        len: usize,
    },

    /// Any other socket error.
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// The most recent round-trip time, readable from any thread.
#[derive(Debug, Clone)]
pub struct LatencyGauge(Arc<AtomicCell<u64>>);

const NO_LATENCY: u64 = u64::MAX;

impl Default for LatencyGauge {
    fn default() -> Self {
        Self(Arc::new(AtomicCell::new(NO_LATENCY)))
    }
}

impl LatencyGauge {
    /// Stores a new round-trip time.
    pub fn record(&self, rtt: Duration) {
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(NO_LATENCY - 1);
        self.0.store(micros.min(NO_LATENCY - 1));
    }

    /// The last round-trip time, if any ping came back.
    pub fn get(&self) -> Option<Duration> {
        match self.0.load() {
            NO_LATENCY => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// [get](Self::get) in whole milliseconds, rounded to nearest.
    pub fn millis(&self) -> Option<u64> {
        self.get().map(|rtt| (rtt.as_micros() as u64 + 500) / 1000)
    }

    /// Forgets the last measurement.
    pub fn clear(&self) {
        self.0.store(NO_LATENCY);
    }
}

/// Invoked once per inbound audio datagram with the payload and its source.
pub type ReceiveCallback = Box<dyn FnMut(&[u8], SocketAddr) + Send>;

#[derive(Default)]
struct Inner {
    socket: Option<Arc<UdpSocket>>,
    peer: Option<SocketAddr>,
    receiver: Option<JoinHandle<()>>,
}

/// One UDP socket serving one [ChannelRole].
///
/// Every method takes `&self`, so a transport can be shared between the
/// thread that sends frames and the one that pings for latency.
pub struct UdpTransport {
    role: ChannelRole,
    bind_host: String,
    inner: Mutex<Inner>,
    callback: Arc<Mutex<Option<ReceiveCallback>>>,
    running: Arc<AtomicBool>,
    latency: LatencyGauge,
    epoch: Instant,
    ping_sequence: AtomicU32,
}

impl UdpTransport {
    /// An unbound transport that will bind on `bind_host`.
    pub fn new(role: ChannelRole, bind_host: impl Into<String>) -> Self {
        Self {
            role,
            bind_host: bind_host.into(),
            inner: Mutex::new(Inner::default()),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            latency: LatencyGauge::default(),
            epoch: Instant::now(),
            ping_sequence: AtomicU32::new(0),
        }
    }

    /// The role this transport was created for.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Binds the local socket. Port 0 picks an ephemeral port.
    pub fn bind(&self, port: u16) -> Result<SocketAddr, TransportError> {
        let mut inner = self.inner();
        let result = self.bind_locked(&mut inner, port);
        self.logged("bind", result)
    }

    /// Sets the destination for [send](Self::send). Binds an ephemeral port
    /// first if needed.
    pub fn connect(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let result = self.connect_inner(host, port);
        self.logged("connect", result)
    }

    /// Allows or forbids sending to broadcast addresses.
    pub fn enable_broadcast(&self, on: bool) -> Result<(), TransportError> {
        let result = self.require_broadcast("enable_broadcast").and_then(|()| {
            let mut inner = self.inner();
            let socket = self.ensure_bound(&mut inner)?;
            socket.set_broadcast(on).map_err(TransportError::Broadcast)
        });
        self.logged("enable_broadcast", result)
    }

    /// Registers the audio callback. Replaces any previous one; may be called
    /// before or after [begin_receiving](Self::begin_receiving).
    pub fn on_receive<F>(&self, callback: F)
    where
        F: FnMut(&[u8], SocketAddr) + Send + 'static,
    {
        *lock(&self.callback) = Some(Box::new(callback));
    }

    /// Starts the receive thread. Binds an ephemeral port first if needed.
    /// Calling it again while receiving does nothing.
    pub fn begin_receiving(&self) -> Result<(), TransportError> {
        let result = self.begin_receiving_inner();
        self.logged("begin_receiving", result)
    }

    /// Sends one datagram to the connected destination, giving up after
    /// `timeout`. A zero timeout has already expired.
    pub fn send(&self, payload: &[u8], timeout: Duration) -> Result<usize, SendError> {
        let (socket, peer) = {
            let inner = self.inner();
            match (&inner.socket, inner.peer) {
                (Some(socket), Some(peer)) => (socket.clone(), peer),
                _ => return Err(SendError::NotConnected),
            }
        };
        if timeout.is_zero() {
            return Err(SendError::Timeout);
        }

        socket.set_write_timeout(Some(timeout))?;
        match socket.send_to(payload, peer) {
            Ok(sent) if sent == payload.len() => Ok(sent),
            Ok(sent) => Err(SendError::Truncated {
                sent,
                len: payload.len(),
            }),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(SendError::Timeout)
            }
            Err(e) => Err(SendError::Io(e)),
        }
    }

    /// Fires a latency ping at the destination and returns the last known
    /// round-trip time in milliseconds. The answer to this ping lands in the
    /// [LatencyGauge] later, once the receive thread sees the pong.
    pub fn measure_latency(&self) -> Option<u64> {
        let stamp = LatencyStamp {
            sequence: self.ping_sequence.fetch_add(1, Ordering::Relaxed),
            sent_at_us: micros_since(self.epoch),
        };
        match Packet::Ping(stamp).encode() {
            Ok(ping) => {
                if let Err(e) = self.send(&ping, PING_SEND_TIMEOUT) {
                    debug!("{self} : latency ping {} not sent: {e}", stamp.sequence);
                }
            }
            Err(e) => warn!("{self} : cannot encode latency ping: {e}"),
        }
        self.latency.millis()
    }

    /// A handle to the round-trip gauge.
    pub fn latency_gauge(&self) -> LatencyGauge {
        self.latency.clone()
    }

    /// Where the transport currently is in its setup.
    pub fn state(&self) -> TransportState {
        let inner = self.inner();
        match (&inner.socket, inner.peer, &inner.receiver) {
            (None, _, _) => TransportState::Unbound,
            (Some(_), _, Some(_)) => TransportState::Receiving,
            (Some(_), Some(_), None) => TransportState::Connected,
            (Some(_), None, None) => TransportState::Bound,
        }
    }

    /// The bound local address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner()
            .socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Stops receiving and releases the socket. The transport is unbound
    /// afterwards and may be set up again. Safe to call at any time.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        let receiver = {
            let mut inner = self.inner();
            inner.socket = None;
            inner.peer = None;
            inner.receiver.take()
        };
        if let Some(receiver) = receiver {
            if receiver.join().is_err() {
                warn!("{self} : receive thread panicked");
            }
            info!("{self} : closed");
        }
        self.latency.clear();
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn bind_locked(&self, inner: &mut Inner, port: u16) -> Result<SocketAddr, TransportError> {
        if let Some(local) = inner.socket.as_ref().and_then(|s| s.local_addr().ok()) {
            return Err(TransportError::AlreadyBound(local));
        }

        let addr = format!("{}:{}", self.bind_host, port);
        let bind_error = |source| TransportError::Bind {
            addr: addr.clone(),
            source,
        };
        let socket = UdpSocket::bind(&addr).map_err(bind_error)?;
        socket
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .map_err(bind_error)?;
        let local = socket.local_addr().map_err(bind_error)?;

        info!("{self} : bound to {local}");
        inner.socket = Some(Arc::new(socket));
        Ok(local)
    }

    fn ensure_bound(&self, inner: &mut Inner) -> Result<Arc<UdpSocket>, TransportError> {
        if inner.socket.is_none() {
            self.bind_locked(inner, 0)?;
        }
        inner
            .socket
            .clone()
            .ok_or_else(|| TransportError::Resolve(self.bind_host.clone()))
    }

    fn connect_inner(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        self.require_broadcast("connect")?;
        let mut inner = self.inner();
        let socket = self.ensure_bound(&mut inner)?;
        let local = socket.local_addr().map_err(TransportError::Receive)?;

        // pick an address of the same family as the socket
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(format!("{host}:{port}")))?
            .find(|addr| addr.is_ipv4() == local.is_ipv4())
            .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}")))?;

        info!("{self} : sending to {peer}");
        inner.peer = Some(peer);
        Ok(peer)
    }

    fn begin_receiving_inner(&self) -> Result<(), TransportError> {
        let mut inner = self.inner();
        if inner.receiver.is_some() {
            return Ok(());
        }
        let socket = self.ensure_bound(&mut inner)?;

        self.running.store(true, Ordering::Release);
        let receive_loop = ReceiveLoop {
            name: self.to_string(),
            socket,
            running: self.running.clone(),
            callback: self.callback.clone(),
            latency: self.latency.clone(),
            epoch: self.epoch,
        };
        let handle = thread::Builder::new()
            .name(format!("{}-receive", self.role))
            .spawn(move || receive_loop.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                TransportError::Receive(e)
            })?;

        info!("{self} : receiving");
        inner.receiver = Some(handle);
        Ok(())
    }

    fn require_broadcast(&self, operation: &'static str) -> Result<(), TransportError> {
        match self.role {
            ChannelRole::Broadcast => Ok(()),
            role => Err(TransportError::RoleMismatch { operation, role }),
        }
    }

    fn logged<T>(
        &self,
        step: &str,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        if let Err(e) = &result {
            warn!("{self} : {step} failed: {e}");
        }
        result
    }
}

impl fmt::Display for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.role)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct ReceiveLoop {
    name: String,
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<ReceiveCallback>>>,
    latency: LatencyGauge,
    epoch: Instant,
}

impl ReceiveLoop {
    fn run(self) {
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.dispatch(&buf[..len], from),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    // e.g. an ICMP port unreachable bounced back to us
                    debug!("{} : receive error: {e}", self.name);
                    thread::sleep(RECV_POLL_INTERVAL);
                }
            }
        }
        debug!("{} : receive thread stopped", self.name);
    }

    fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        match wire::peek_kind(datagram) {
            Some(PacketKind::Ping) => {
                if let Ok(Packet::Ping(stamp)) = wire::decode(datagram) {
                    self.answer(stamp, from);
                }
            }
            Some(PacketKind::Pong) => {
                if let Ok(Packet::Pong(stamp)) = wire::decode(datagram) {
                    let now = micros_since(self.epoch);
                    let rtt = Duration::from_micros(now.saturating_sub(stamp.sent_at_us));
                    debug!("{} : ping {} came back after {rtt:?}", self.name, stamp.sequence);
                    self.latency.record(rtt);
                }
            }
            _ => {
                if let Some(callback) = lock(&self.callback).as_mut() {
                    callback(datagram, from);
                }
            }
        }
    }

    fn answer(&self, stamp: LatencyStamp, to: SocketAddr) {
        let Ok(pong) = Packet::Pong(stamp).encode() else {
            return;
        };
        if let Err(e) = self.socket.send_to(&pong, to) {
            debug!("{} : cannot answer ping from {to}: {e}", self.name);
        }
    }
}

fn micros_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    const LOCALHOST: &str = "127.0.0.1";
    const WAIT: Duration = Duration::from_secs(2);

    fn listening_subscriber() -> (UdpTransport, SocketAddr) {
        let subscriber = UdpTransport::new(ChannelRole::Subscribe, LOCALHOST);
        let addr = subscriber.bind(0).unwrap();
        subscriber.begin_receiving().unwrap();
        (subscriber, addr)
    }

    #[test]
    fn state_machine() {
        let transport = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        assert_eq!(transport.state(), TransportState::Unbound);
        assert_eq!(transport.local_addr(), None);

        let local = transport.bind(0).unwrap();
        assert_eq!(transport.state(), TransportState::Bound);
        assert_eq!(transport.local_addr(), Some(local));
        assert!(matches!(
            transport.bind(0),
            Err(TransportError::AlreadyBound(addr)) if addr == local
        ));

        transport.connect(LOCALHOST, 9).unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        transport.begin_receiving().unwrap();
        transport.begin_receiving().unwrap();
        assert_eq!(transport.state(), TransportState::Receiving);

        transport.close();
        assert_eq!(transport.state(), TransportState::Unbound);
    }

    #[test]
    fn connect_binds_an_ephemeral_port() {
        let transport = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        transport.connect(LOCALHOST, 9).unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_ne!(transport.local_addr().map(|a| a.port()), Some(0));
    }

    #[test]
    fn send_before_connect_is_refused() {
        let transport = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        assert!(matches!(
            transport.send(b"hello", WAIT),
            Err(SendError::NotConnected)
        ));
        transport.bind(0).unwrap();
        assert!(matches!(
            transport.send(b"hello", WAIT),
            Err(SendError::NotConnected)
        ));
    }

    #[test]
    fn expired_send_is_a_delivery_failure() {
        let (_subscriber, addr) = listening_subscriber();
        let transport = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        transport.connect(LOCALHOST, addr.port()).unwrap();
        assert!(matches!(
            transport.send(b"late", Duration::ZERO),
            Err(SendError::Timeout)
        ));
        // the transport stays usable
        assert_eq!(transport.send(b"on time", WAIT).unwrap(), 7);
    }

    #[test]
    fn subscribe_role_cannot_send() {
        let transport = UdpTransport::new(ChannelRole::Subscribe, LOCALHOST);
        assert!(matches!(
            transport.connect(LOCALHOST, 7000),
            Err(TransportError::RoleMismatch {
                operation: "connect",
                role: ChannelRole::Subscribe
            })
        ));
        assert!(matches!(
            transport.enable_broadcast(true),
            Err(TransportError::RoleMismatch { .. })
        ));
        assert_eq!(transport.state(), TransportState::Unbound);
    }

    #[test]
    fn bad_destination_is_reported() {
        let transport = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        assert!(matches!(
            transport.connect("no such host.invalid", 7000),
            Err(TransportError::Resolve(_))
        ));
        // still bound, receiving can go ahead
        assert_eq!(transport.state(), TransportState::Bound);
        assert!(transport.begin_receiving().is_ok());
    }

    #[test]
    fn broadcast_reaches_subscriber() {
        let (subscriber, addr) = listening_subscriber();
        let (tx, rx) = channel();
        subscriber.on_receive(move |payload, from| {
            let _ = tx.send((payload.to_vec(), from));
        });

        let broadcaster = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        broadcaster.enable_broadcast(true).unwrap();
        broadcaster.connect(LOCALHOST, addr.port()).unwrap();

        for payload in [&b"one"[..], &b"two"[..]] {
            broadcaster.send(payload, WAIT).unwrap();
            let (received, from) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(received, payload);
            assert_eq!(Some(from), broadcaster.local_addr());
        }
    }

    #[test]
    fn latency_ping_round_trip() {
        let (subscriber, addr) = listening_subscriber();
        let (tx, rx) = channel();
        subscriber.on_receive(move |payload, _| {
            let _ = tx.send(payload.to_vec());
        });

        let broadcaster = UdpTransport::new(ChannelRole::Broadcast, LOCALHOST);
        broadcaster.connect(LOCALHOST, addr.port()).unwrap();
        broadcaster.begin_receiving().unwrap();
        let gauge = broadcaster.latency_gauge();
        assert_eq!(gauge.get(), None);

        // non-blocking: the first call cannot know the answer yet
        assert_eq!(broadcaster.measure_latency(), None);

        let deadline = Instant::now() + WAIT;
        while gauge.get().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let rtt = gauge.get().expect("no pong within two seconds");
        assert!(rtt < WAIT);
        assert!(broadcaster.measure_latency().is_some());

        // pings are not audio
        assert!(rx.try_recv().is_err());

        broadcaster.close();
        assert_eq!(gauge.get(), None);
    }

    #[test]
    fn gauge_rounds_to_milliseconds() {
        let gauge = LatencyGauge::default();
        assert_eq!(gauge.millis(), None);
        gauge.record(Duration::from_micros(12_600));
        assert_eq!(gauge.millis(), Some(13));
        gauge.clear();
        assert_eq!(gauge.get(), None);
    }

    #[test]
    fn bindings_filter_senders() {
        let binding = ChannelBinding::subscribe("bob", "alice");
        assert!(binding.accepts("alice"));
        assert!(!binding.accepts("mallory"));
        assert!(ChannelBinding::subscribe("bob", "").accepts("anyone"));
        assert_eq!(
            ChannelBinding::broadcast("alice", "bob").role,
            ChannelRole::Broadcast
        );
    }
}

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coapbench_common::config::{registration_update_uri, DEFAULT_COAP_PORT, RECEIVE_TIMEOUT};
use coapbench_common::{BenchError, CorrelationToken, Method, ResponseCode, ResponseView, Result};
use tracing::{debug, warn};
use url::{Host, Url};

pub mod producer;
pub use producer::{CoapProducer, MessageProducer};

/// Large enough for any response the benchmark inspects.
const RECV_BUF_SIZE: usize = 1500;

/// How a client behaves when `run` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMode {
    Steady,
    /// Register first; the update target is built from `scheme` and the
    /// location the registration response carries.
    RegisterThenSteady { scheme: String },
}

/// Virtual client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target: String,
    pub method: Method,
    pub payload: Option<Vec<u8>>,
    pub bind: Option<SocketAddr>,
    pub receive_timeout: Duration,
    pub track_latency: bool,
    pub mode: ClientMode,
}

impl ClientConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: Method::Get,
            payload: None,
            bind: None,
            receive_timeout: RECEIVE_TIMEOUT,
            track_latency: false,
            mode: ClientMode::Steady,
        }
    }
}

/// Cloneable handle that clears a client's running flag from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Counters of one client at the end of a phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSnapshot {
    pub index: usize,
    pub count: u64,
    pub timeouts: u64,
    pub latencies: Vec<u32>,
}

/// One simulated user with at most one request in flight.
pub struct VirtualClient {
    index: usize,
    socket: UdpSocket,
    producer: Box<dyn MessageProducer>,
    target: Url,
    dest: SocketAddr,
    method: Method,
    mode: ClientMode,
    receive_timeout: Duration,
    track_latency: bool,
    running: Arc<AtomicBool>,
    token: Option<CorrelationToken>,
    sent_at: Instant,
    count: u64,
    lost: u64,
    latencies: Vec<u32>,
    recv_buf: Vec<u8>,
}

impl VirtualClient {
    /// Bind a socket and aim the client at `config.target`.
    pub fn new(index: usize, config: ClientConfig) -> Result<Self> {
        let target = parse_uri(&config.target)?;
        let producer = CoapProducer::new(&target, config.method, config.payload.as_deref());
        Self::with_producer(index, config, Box::new(producer))
    }

    pub fn with_producer(
        index: usize,
        config: ClientConfig,
        producer: Box<dyn MessageProducer>,
    ) -> Result<Self> {
        let target = parse_uri(&config.target)?;
        let dest = resolve(&target, config.bind)?;
        let socket = bind_socket(config.bind, dest)?;
        Ok(Self {
            index,
            socket,
            producer,
            target,
            dest,
            method: config.method,
            mode: config.mode,
            receive_timeout: config.receive_timeout,
            track_latency: config.track_latency,
            running: Arc::new(AtomicBool::new(true)),
            token: None,
            sent_at: Instant::now(),
            count: 0,
            lost: 0,
            latencies: Vec::new(),
            recv_buf: vec![0; RECV_BUF_SIZE],
        })
    }

    /// Replace the socket with one bound to `local` (or an OS-chosen address).
    pub fn bind(&mut self, local: Option<SocketAddr>) -> Result<()> {
        self.socket = bind_socket(local, self.dest)?;
        Ok(())
    }

    /// Point subsequent requests at `uri`.
    pub fn configure_target(&mut self, uri: &str, method: Method, payload: Option<&[u8]>) -> Result<()> {
        let target = parse_uri(uri)?;
        let local = self.socket.local_addr().ok();
        self.dest = resolve(&target, local)?;
        self.producer.set_target(&target, method, payload);
        self.target = target;
        self.method = method;
        Ok(())
    }

    /// Issue requests until stopped. A protocol violation or a socket
    /// failure ends the loop and is returned to the caller.
    pub fn run(&mut self) -> Result<()> {
        self.latencies.clear();
        if matches!(self.mode, ClientMode::RegisterThenSteady { .. }) && self.is_running() {
            self.register()?;
        }
        while self.is_running() {
            self.exchange()?;
        }
        Ok(())
    }

    /// Send the registration and make one receive attempt. On success the
    /// client switches to updating the returned location.
    pub fn register(&mut self) -> Result<()> {
        let scheme = match &self.mode {
            ClientMode::RegisterThenSteady { scheme } => scheme.clone(),
            ClientMode::Steady => return Ok(()),
        };
        let sent = self.send_request()?;
        let deadline = self.sent_at + self.receive_timeout;
        if sent.is_none() {
            self.lose_cycle(deadline);
            return Ok(());
        }

        let Some(len) = self.receive_before(deadline)? else {
            self.lost += 1;
            return Ok(());
        };
        let Some(response) = ResponseView::parse(&self.recv_buf[..len]) else {
            warn!(client = self.index, len, "Malformed registration response");
            self.lost += 1;
            return Ok(());
        };
        let status = response.status();
        let location = response.location();
        self.check_code(status)?;
        self.record_completion();

        match location {
            Some(location) => {
                let uri = registration_update_uri(&scheme, &location);
                self.configure_target(&uri, Method::Post, None)?;
                self.mode = ClientMode::Steady;
                debug!(client = self.index, %uri, "Registered");
            }
            None => warn!(client = self.index, "Registration response carries no location"),
        }
        Ok(())
    }

    /// One request cycle: send, then wait for the matching response until the
    /// cycle deadline. Every response must carry an accepted code; those with
    /// another token are then dropped.
    pub fn exchange(&mut self) -> Result<()> {
        let sent = self.send_request()?;
        let deadline = self.sent_at + self.receive_timeout;
        let Some(token) = sent else {
            self.lose_cycle(deadline);
            return Ok(());
        };
        loop {
            let Some(len) = self.receive_before(deadline)? else {
                self.lost += 1;
                return Ok(());
            };
            let Some(response) = ResponseView::parse(&self.recv_buf[..len]) else {
                warn!(client = self.index, len, "Dropping malformed datagram");
                continue;
            };
            let (actual, status) = (response.token(), response.status());
            self.check_code(status)?;
            if actual != token {
                warn!(
                    client = self.index,
                    expected = %token,
                    actual = %actual,
                    "Received message with wrong MID"
                );
                continue;
            }
            self.record_completion();
            return Ok(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask `run` to return after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Clear the counters and arm the running flag for a new phase.
    pub fn reset(&mut self) {
        self.running.store(true, Ordering::Release);
        self.count = 0;
        self.lost = 0;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn timeouts(&self) -> u64 {
        self.lost
    }

    pub fn latencies(&self) -> &[u32] {
        &self.latencies
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            index: self.index,
            count: self.count,
            timeouts: self.lost,
            latencies: self.latencies.clone(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn mode(&self) -> &ClientMode {
        &self.mode
    }

    /// Token of the most recently sent request.
    pub fn last_token(&self) -> Option<CorrelationToken> {
        self.token
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(|e| BenchError::NetworkError(e.to_string()))
    }

    pub fn set_track_latency(&mut self, track: bool) {
        self.track_latency = track;
    }

    /// Release the socket.
    pub fn close(self) {
        debug!(client = self.index, "Closing virtual client");
    }

    /// `Ok(None)` when the network refused the datagram; the cycle is lost
    /// but the client keeps going.
    fn send_request(&mut self) -> Result<Option<CorrelationToken>> {
        let datagram = self.producer.next();
        let token = CorrelationToken::from_datagram(&datagram).ok_or_else(|| {
            BenchError::NetworkError(format!("producer emitted a {}-byte datagram", datagram.len()))
        })?;
        self.token = Some(token);
        self.sent_at = Instant::now();
        match self.socket.send_to(&datagram, self.dest) {
            Ok(_) => Ok(Some(token)),
            Err(e) if is_transient_send_error(e.kind()) => {
                debug!(client = self.index, dest = %self.dest, "Send failed: {}", e);
                Ok(None)
            }
            Err(e) => Err(BenchError::NetworkError(e.to_string())),
        }
    }

    /// Count a lost cycle once its deadline has passed.
    fn lose_cycle(&mut self, deadline: Instant) {
        std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
        self.lost += 1;
    }

    /// `Ok(None)` once the deadline has passed without a datagram.
    fn receive_before(&mut self, deadline: Instant) -> Result<Option<usize>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        self.socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| BenchError::NetworkError(e.to_string()))?;
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, _)) => Ok(Some(len)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // ICMP port unreachable surfaces here on some platforms
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                Ok(None)
            }
            Err(e) => Err(BenchError::NetworkError(e.to_string())),
        }
    }

    fn check_code(&self, status: ResponseCode) -> Result<()> {
        if self.method.accepts(status) {
            Ok(())
        } else {
            Err(BenchError::ProtocolViolation { code: status, method: self.method })
        }
    }

    fn record_completion(&mut self) {
        if self.track_latency {
            self.latencies.push(self.sent_at.elapsed().as_millis() as u32);
        }
        self.count += 1;
    }
}

/// Parse a `coap://host[:port]/path?query` URI.
pub fn parse_uri(uri: &str) -> Result<Url> {
    let url = Url::parse(uri).map_err(|e| BenchError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    if url.host().is_none() {
        return Err(BenchError::InvalidUri { uri: uri.to_string(), reason: "no host".to_string() });
    }
    Ok(url)
}

/// Resolve the destination, preferring the address family of the local bind.
pub fn resolve(uri: &Url, local: Option<SocketAddr>) -> Result<SocketAddr> {
    let port = uri.port().unwrap_or(DEFAULT_COAP_PORT);
    let candidates: Vec<SocketAddr> = match uri.host() {
        Some(Host::Ipv4(ip)) => vec![SocketAddr::from((ip, port))],
        Some(Host::Ipv6(ip)) => vec![SocketAddr::from((ip, port))],
        Some(Host::Domain(name)) => (name, port)
            .to_socket_addrs()
            .map_err(|_| BenchError::UnresolvedHost(name.to_string()))?
            .collect(),
        None => return Err(BenchError::InvalidUri { uri: uri.to_string(), reason: "no host".to_string() }),
    };
    let preferred = local.and_then(|l| candidates.iter().find(|c| c.is_ipv4() == l.is_ipv4()).copied());
    preferred
        .or_else(|| candidates.first().copied())
        .ok_or_else(|| BenchError::UnresolvedHost(uri.host_str().unwrap_or_default().to_string()))
}

/// Send failures caused by routing or by the destination, as opposed to a
/// broken local socket.
fn is_transient_send_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::AddrNotAvailable
            | ErrorKind::PermissionDenied
    )
}

fn bind_socket(local: Option<SocketAddr>, dest: SocketAddr) -> Result<UdpSocket> {
    let addr = local.unwrap_or_else(|| match dest {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    });
    UdpSocket::bind(addr).map_err(|e| BenchError::Bind { addr: addr.to_string(), reason: e.to_string() })
}

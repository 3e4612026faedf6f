//! Minimal CoAP responder used as the load target in tests and local runs.
//!
//! It answers every confirmable request with a piggybacked ACK carrying the
//! request's message id. Registrations (`POST` to `rd` with an `ep=` query)
//! get `2.01 Created` and a two-segment Location-Path `rd/<id>` laid out so
//! that `<id>` starts at byte 8 of the datagram.

use byteorder::{BigEndian, ByteOrder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use coapbench_common::wire::{
    ACK, HEADER_LEN, OPTION_LOCATION_PATH, OPTION_URI_PATH, OPTION_URI_QUERY, PAYLOAD_MARKER,
    TOKEN_OFFSET,
};
use coapbench_common::{Method, ResponseCode};

pub mod config;
use config::{DEFAULT_DELAY, FIRST_REGISTRATION_ID, MAX_DATAGRAM};

/// How the responder answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// The success code that matches the request method.
    Echo,
    /// Never answer.
    Silent,
    /// Always answer with this raw response code.
    Code(u8),
}

/// A parsed confirmable request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub path: Vec<String>,
    pub query: Vec<String>,
    pub payload: Vec<u8>,
}

impl Request {
    /// `None` for datagrams that are not well-formed CoAP.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < HEADER_LEN || datagram[0] >> 6 != 1 {
            return None;
        }
        let token_len = (datagram[0] & 0x0f) as usize;
        if token_len > 8 || datagram.len() < HEADER_LEN + token_len {
            return None;
        }

        let mut request = Request {
            code: datagram[1],
            message_id: BigEndian::read_u16(&datagram[TOKEN_OFFSET..]),
            token: datagram[HEADER_LEN..HEADER_LEN + token_len].to_vec(),
            path: Vec::new(),
            query: Vec::new(),
            payload: Vec::new(),
        };

        let mut pos = HEADER_LEN + token_len;
        let mut number = 0u16;
        while pos < datagram.len() {
            if datagram[pos] == PAYLOAD_MARKER {
                request.payload = datagram[pos + 1..].to_vec();
                break;
            }
            let head = datagram[pos];
            pos += 1;
            let delta = read_extended(datagram, &mut pos, head >> 4)?;
            let len = read_extended(datagram, &mut pos, head & 0x0f)? as usize;
            let value = datagram.get(pos..pos + len)?;
            pos += len;

            number = number.checked_add(delta)?;
            let text = String::from_utf8_lossy(value).into_owned();
            match number {
                OPTION_URI_PATH => request.path.push(text),
                OPTION_URI_QUERY => request.query.push(text),
                _ => {}
            }
        }
        Some(request)
    }

    pub fn method(&self) -> Option<Method> {
        Method::from_code(self.code)
    }

    /// `POST rd?...&ep=<name>`
    pub fn is_registration(&self) -> bool {
        self.method() == Some(Method::Post)
            && self.path.len() == 1
            && self.path[0] == "rd"
            && self.query.iter().any(|q| q.starts_with("ep="))
    }
}

fn read_extended(datagram: &[u8], pos: &mut usize, nibble: u8) -> Option<u16> {
    match nibble {
        0..=12 => Some(nibble as u16),
        13 => {
            let b = *datagram.get(*pos)?;
            *pos += 1;
            Some(b as u16 + 13)
        }
        14 => {
            let bytes = datagram.get(*pos..*pos + 2)?;
            *pos += 2;
            BigEndian::read_u16(bytes).checked_add(269)
        }
        _ => None,
    }
}

/// Builds the reply for each request; holds the registration counter.
#[derive(Debug)]
pub struct Responder {
    behavior: Behavior,
    next_registration: u32,
}

impl Responder {
    pub fn new(behavior: Behavior) -> Self {
        Self { behavior, next_registration: FIRST_REGISTRATION_ID }
    }

    /// The reply datagram, or `None` when the request goes unanswered.
    pub fn respond(&mut self, request: &Request) -> Option<Vec<u8>> {
        let code = match self.behavior {
            Behavior::Silent => return None,
            Behavior::Code(code) => return Some(ack(request, ResponseCode(code), request.message_id)),
            Behavior::Echo => match request.method() {
                Some(Method::Get) => ResponseCode::CONTENT,
                Some(Method::Post) if request.is_registration() => {
                    let id = format!("{:x}", self.next_registration);
                    self.next_registration = self.next_registration.wrapping_add(1);
                    return Some(registration_ack(request, &id));
                }
                Some(Method::Post) | Some(Method::Put) => ResponseCode::CHANGED,
                Some(Method::Delete) => ResponseCode::DELETED,
                None => ResponseCode::BAD_REQUEST,
            },
        };
        Some(ack(request, code, request.message_id))
    }
}

/// Piggybacked ACK without options.
pub fn ack(request: &Request, code: ResponseCode, message_id: u16) -> Vec<u8> {
    let mut reply = vec![ACK | request.token.len() as u8, code.0, 0, 0];
    BigEndian::write_u16(&mut reply[TOKEN_OFFSET..], message_id);
    reply.extend_from_slice(&request.token);
    reply
}

/// `2.01 Created` with Location-Path `rd` and `<id>`. Ids longer than 12
/// bytes would need an extended option length and are not produced.
pub fn registration_ack(request: &Request, id: &str) -> Vec<u8> {
    let mut reply = ack(request, ResponseCode::CREATED, request.message_id);
    reply.push(((OPTION_LOCATION_PATH as u8) << 4) | 2);
    reply.extend_from_slice(b"rd");
    reply.push(id.len().min(12) as u8);
    reply.extend_from_slice(&id.as_bytes()[..id.len().min(12)]);
    reply
}

/// Requests seen by a running server, in arrival order.
pub type RequestLog = Arc<Mutex<Vec<Request>>>;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub behavior: Behavior,
    /// Replies with a wrong message id sent ahead of each real reply.
    pub stale_responses: usize,
    pub delay: Duration,
    /// Keep every parsed request in the server's [`RequestLog`].
    pub record: bool,
}

impl ServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            behavior: Behavior::Echo,
            stale_responses: 0,
            delay: DEFAULT_DELAY,
            record: false,
        }
    }
}

/// UDP CoAP responder
pub struct Server {
    config: ServerConfig,
    log: RequestLog,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, log: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Shared handle to the recorded requests; empty unless `record` is set.
    pub fn log(&self) -> RequestLog {
        Arc::clone(&self.log)
    }

    /// Run the server, signalling `ready_tx` with the bound address once receiving
    pub async fn run(self, ready_tx: tokio::sync::oneshot::Sender<SocketAddr>) -> Result<(), Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(self.config.address).await?);
        let local_addr = socket.local_addr()?;
        info!("Listening on {} ({:?})", local_addr, self.config.behavior);
        ready_tx.send(local_addr).ok();

        let mut responder = Responder::new(self.config.behavior);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier replies surface here on some platforms
                    debug!("Receive failed: {}", e);
                    continue;
                }
            };
            let Some(request) = Request::parse(&buf[..len]) else {
                debug!("Dropping malformed datagram of {} bytes from {}", len, peer);
                continue;
            };
            debug!(mid = request.message_id, code = request.code, %peer, "Request");
            if self.config.record {
                self.log.lock().await.push(request.clone());
            }

            let Some(reply) = responder.respond(&request) else {
                continue;
            };
            let mut replies = Vec::with_capacity(self.config.stale_responses + 1);
            for i in 0..self.config.stale_responses {
                let stale = request.message_id.wrapping_sub(i as u16 + 1);
                replies.push(ack(&request, ResponseCode::CONTENT, stale));
            }
            replies.push(reply);

            if self.config.delay.is_zero() {
                send_all(&socket, &replies, peer).await;
            } else {
                let socket = Arc::clone(&socket);
                let delay = self.config.delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send_all(&socket, &replies, peer).await;
                });
            }
        }
    }
}

async fn send_all(socket: &UdpSocket, replies: &[Vec<u8>], peer: SocketAddr) {
    for reply in replies {
        if let Err(e) = socket.send_to(reply, peer).await {
            warn!("Failed to answer {}: {}", peer, e);
        }
    }
}

use byteorder::{BigEndian, WriteBytesExt};
use coapbench_common::wire::{
    CON_NO_TOKEN, HEADER_LEN, OPTION_URI_PATH, OPTION_URI_QUERY, PAYLOAD_MARKER,
};
use coapbench_common::{CorrelationToken, Method};
use url::Url;

/// Source of request datagrams for one virtual client.
pub trait MessageProducer: Send {
    /// Encode the next request; every call carries a fresh correlation token.
    fn next(&mut self) -> Vec<u8>;

    /// Redirect all subsequent requests.
    fn set_target(&mut self, uri: &Url, method: Method, payload: Option<&[u8]>);
}

/// Confirmable CoAP requests without a token. The message is encoded once per
/// target and only the message id changes between requests.
pub struct CoapProducer {
    template: Vec<u8>,
    mid: u16,
}

impl CoapProducer {
    /// Start at a random message id.
    pub fn new(uri: &Url, method: Method, payload: Option<&[u8]>) -> Self {
        Self::with_initial_mid(uri, method, payload, rand::random())
    }

    pub fn with_initial_mid(uri: &Url, method: Method, payload: Option<&[u8]>, mid: u16) -> Self {
        Self { template: encode_request(uri, method, payload), mid }
    }
}

impl MessageProducer for CoapProducer {
    fn next(&mut self) -> Vec<u8> {
        self.mid = self.mid.wrapping_add(1);
        let mut datagram = self.template.clone();
        CorrelationToken(self.mid).write_into(&mut datagram);
        datagram
    }

    fn set_target(&mut self, uri: &Url, method: Method, payload: Option<&[u8]>) {
        self.template = encode_request(uri, method, payload);
    }
}

/// Encode a request with message id 0.
pub fn encode_request(uri: &Url, method: Method, payload: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(CON_NO_TOKEN);
    buf.push(method.code());
    buf.extend_from_slice(&[0, 0]);
    debug_assert_eq!(buf.len(), HEADER_LEN);

    let mut options: Vec<(u16, &[u8])> = Vec::new();
    if let Some(segments) = uri.path_segments() {
        options.extend(
            segments
                .filter(|s| !s.is_empty())
                .map(|s| (OPTION_URI_PATH, s.as_bytes())),
        );
    }
    if let Some(query) = uri.query() {
        options.extend(
            query
                .split('&')
                .filter(|q| !q.is_empty())
                .map(|q| (OPTION_URI_QUERY, q.as_bytes())),
        );
    }

    let mut previous = 0;
    for (number, value) in options {
        write_option(&mut buf, number - previous, value);
        previous = number;
    }

    if let Some(payload) = payload.filter(|p| !p.is_empty()) {
        buf.push(PAYLOAD_MARKER);
        buf.extend_from_slice(payload);
    }
    buf
}

fn write_option(buf: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let (delta_nibble, delta_ext) = split_nibble(delta);
    let (len_nibble, len_ext) = split_nibble(value.len() as u16);
    buf.push((delta_nibble << 4) | len_nibble);
    write_extension(buf, delta_nibble, delta_ext);
    write_extension(buf, len_nibble, len_ext);
    buf.extend_from_slice(value);
}

fn split_nibble(value: u16) -> (u8, u16) {
    match value {
        0..=12 => (value as u8, 0),
        13..=268 => (13, value - 13),
        _ => (14, value - 269),
    }
}

fn write_extension(buf: &mut Vec<u8>, nibble: u8, ext: u16) {
    match nibble {
        13 => buf.push(ext as u8),
        // writing into a Vec cannot fail
        14 => buf.write_u16::<BigEndian>(ext).unwrap_or_default(),
        _ => {}
    }
}

//! Header fields the benchmark reads from and writes into CoAP datagrams.
//!
//! The load generator only ever inspects three things in a response: the
//! status code at [`STATUS_OFFSET`], the two-byte message id at
//! [`TOKEN_OFFSET`] that correlates it with the outstanding request, and, for
//! registrations, the location string starting at [`LOCATION_OFFSET`].
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Location-Path "rd" (3 bytes)            |opt hdr| location ... |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Offset of the response code byte.
pub const STATUS_OFFSET: usize = 1;
/// Offset of the big-endian message id used as correlation token.
pub const TOKEN_OFFSET: usize = 2;
/// Offset at which a registration response carries its location string.
pub const LOCATION_OFFSET: usize = 8;
/// Length of the fixed CoAP header.
pub const HEADER_LEN: usize = 4;

/// CoAP protocol version 1, confirmable, no token.
pub const CON_NO_TOKEN: u8 = 0x40;
/// CoAP protocol version 1, acknowledgement; OR the token length in.
pub const ACK: u8 = 0x60;
/// Marker separating options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

pub const OPTION_LOCATION_PATH: u16 = 8;
pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_URI_QUERY: u16 = 15;

/// Request method; the discriminant is the CoAP request code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

impl Method {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Method::Get),
            2 => Some(Method::Post),
            3 => Some(Method::Put),
            4 => Some(Method::Delete),
            _ => None,
        }
    }

    /// Response codes that count as success for this method.
    pub fn accepted_codes(self) -> &'static [ResponseCode] {
        match self {
            Method::Get => &[ResponseCode::CONTENT, ResponseCode::VALID],
            Method::Post => &[
                ResponseCode::CREATED,
                ResponseCode::CHANGED,
                ResponseCode::CONTENT,
                ResponseCode::DELETED,
            ],
            Method::Put => &[ResponseCode::CHANGED, ResponseCode::CREATED],
            Method::Delete => &[ResponseCode::DELETED],
        }
    }

    pub fn accepts(self, code: ResponseCode) -> bool {
        self.accepted_codes().contains(&code)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(format!("unknown method {s:?}")),
        }
    }
}

/// A CoAP code byte: class in the top three bits, detail in the low five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    pub const CREATED: ResponseCode = ResponseCode::new(2, 1);
    pub const DELETED: ResponseCode = ResponseCode::new(2, 2);
    pub const VALID: ResponseCode = ResponseCode::new(2, 3);
    pub const CHANGED: ResponseCode = ResponseCode::new(2, 4);
    pub const CONTENT: ResponseCode = ResponseCode::new(2, 5);
    pub const BAD_REQUEST: ResponseCode = ResponseCode::new(4, 0);
    pub const NOT_FOUND: ResponseCode = ResponseCode::new(4, 4);
    pub const INTERNAL_SERVER_ERROR: ResponseCode = ResponseCode::new(5, 0);

    pub const fn new(class: u8, detail: u8) -> Self {
        ResponseCode((class << 5) | (detail & 0x1F))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// The two-byte message id a response must echo to match a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(pub u16);

impl CorrelationToken {
    /// Read the token from any datagram long enough to carry a header.
    pub fn from_datagram(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        Some(CorrelationToken(BigEndian::read_u16(
            &datagram[TOKEN_OFFSET..TOKEN_OFFSET + 2],
        )))
    }

    /// Overwrite the token of an already encoded datagram.
    pub fn write_into(self, datagram: &mut [u8]) {
        BigEndian::write_u16(&mut datagram[TOKEN_OFFSET..TOKEN_OFFSET + 2], self.0);
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only view over a received datagram.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    bytes: &'a [u8],
}

impl<'a> ResponseView<'a> {
    /// Returns `None` when the datagram is shorter than a CoAP header.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(ResponseView { bytes })
    }

    pub fn status(&self) -> ResponseCode {
        ResponseCode(self.bytes[STATUS_OFFSET])
    }

    pub fn token(&self) -> CorrelationToken {
        CorrelationToken(BigEndian::read_u16(
            &self.bytes[TOKEN_OFFSET..TOKEN_OFFSET + 2],
        ))
    }

    /// Location string of a registration response, if the datagram is long enough.
    pub fn location(&self) -> Option<String> {
        if self.bytes.len() <= LOCATION_OFFSET {
            return None;
        }
        Some(String::from_utf8_lossy(&self.bytes[LOCATION_OFFSET..]).into_owned())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

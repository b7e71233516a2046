pub mod client;
pub mod server;
pub mod slave;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

// STUN constants
pub const MAGIC_COOKIE: u32 = 0x2112A442;
pub const HEADER_LEN: usize = 20;
pub const DEFAULT_PORT: u16 = 3478;
pub const DEFAULT_ALT_PORT: u16 = 3479;

// Attribute types
pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const CHANGE_REQUEST: u16 = 0x0003;
pub const ERROR_CODE: u16 = 0x0009;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const OTHER_ADDRESS: u16 = 0x802C;

// Address families
pub const FAMILY_IPV4: u8 = 0x01;
pub const FAMILY_IPV6: u8 = 0x02;

// CHANGE-REQUEST flag bits
const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

const METHOD_BINDING: u16 = 0x0001;
const CLASS_REQUEST: u8 = 0b00;
const CLASS_SUCCESS: u8 = 0b10;

/// Interleave a 2-bit class into a 12-bit method per the RFC 5389 message
/// type layout (the class bits sit at positions 4 and 8).
fn msg_type(class: u8, method: u16) -> u16 {
    ((method & 0x0f80) << 2)
        | ((method & 0x0070) << 1)
        | (method & 0x000f)
        | ((u16::from(class) & 0x02) << 7)
        | ((u16::from(class) & 0x01) << 4)
}

fn is_request(msg_type: u16) -> bool {
    msg_type & 0x0110 == 0x0000
}

fn is_success_response(msg_type: u16) -> bool {
    msg_type & 0x0110 == 0x0100
}

fn method(msg_type: u16) -> u16 {
    (msg_type & 0x000f) | ((msg_type & 0x00e0) >> 1) | ((msg_type & 0x3e00) >> 2)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn generate() -> Self {
        TransactionId(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        TransactionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

#[derive(Debug)]
pub enum StunError {
    /// An address or port string could not be parsed or resolved.
    Resolve(String),
    /// A UDP or TCP endpoint could not be bound.
    Bind(io::Error),
    /// Transient send/recv/accept failure.
    Io(io::Error),
    /// No usable reply within the request window.
    Timeout,
    /// STUN decode failed.
    MalformedMessage,
    /// A reply arrived from an address the caller declared illegitimate.
    UnexpectedSource(SocketAddr),
    /// The peer answered with an ERROR-CODE attribute.
    ErrorResponse { code: u16, reason: String },
    /// Transaction id, class, or mapped address did not line up.
    ProtocolMismatch,
}

impl fmt::Display for StunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StunError::Resolve(addr) => write!(f, "cannot resolve address {}", addr),
            StunError::Bind(err) => write!(f, "bind failed: {}", err),
            StunError::Io(err) => write!(f, "i/o error: {}", err),
            StunError::Timeout => write!(f, "request timed out"),
            StunError::MalformedMessage => write!(f, "malformed STUN message"),
            StunError::UnexpectedSource(src) => {
                write!(f, "reply from unexpected source {}", src)
            }
            StunError::ErrorResponse { code, reason } => {
                write!(f, "server error {}: {}", code, reason)
            }
            StunError::ProtocolMismatch => write!(f, "reply does not match the request"),
        }
    }
}

impl std::error::Error for StunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StunError::Bind(err) | StunError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StunError {
    fn from(err: io::Error) -> Self {
        StunError::Io(err)
    }
}

/// Resolve a `host:port` string, preferring IPv4 results.
pub fn resolve_addr(addr: &str) -> Result<SocketAddr, StunError> {
    let resolved = addr
        .to_socket_addrs()
        .map_err(|_| StunError::Resolve(addr.to_string()))?;
    let mut first = None;
    for candidate in resolved {
        if candidate.is_ipv4() {
            return Ok(candidate);
        }
        first.get_or_insert(candidate);
    }
    first.ok_or_else(|| StunError::Resolve(addr.to_string()))
}

/// A binding request. `encode` always emits a CHANGE-REQUEST attribute, with
/// both flags zero for a plain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
    pub change_ip: bool,
    pub change_port: bool,
}

impl BindingRequest {
    pub fn new() -> Self {
        Self::with_transaction_id(TransactionId::generate())
    }

    pub fn with_transaction_id(transaction_id: TransactionId) -> Self {
        BindingRequest {
            transaction_id,
            change_ip: false,
            change_port: false,
        }
    }

    pub fn change_request(mut self, change_ip: bool, change_port: bool) -> Self {
        self.change_ip = change_ip;
        self.change_port = change_port;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 8);
        buf.extend_from_slice(&msg_type(CLASS_REQUEST, METHOD_BINDING).to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(self.transaction_id.as_bytes());

        let mut flags = 0u32;
        if self.change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if self.change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        buf.extend_from_slice(&CHANGE_REQUEST.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&flags.to_be_bytes());

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        let (msg_type, transaction_id) = check_header(data)?;
        if !is_request(msg_type) || method(msg_type) != METHOD_BINDING {
            return Err(StunError::MalformedMessage);
        }

        let mut req = BindingRequest::with_transaction_id(transaction_id);
        walk_attributes(&data[HEADER_LEN..], |attr_type, value| {
            if attr_type == CHANGE_REQUEST {
                if value.len() < 4 {
                    return Err(StunError::MalformedMessage);
                }
                let flags = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                req.change_ip = flags & CHANGE_IP_FLAG != 0;
                req.change_port = flags & CHANGE_PORT_FLAG != 0;
            }
            Ok(())
        })?;
        Ok(req)
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// A binding success response. The decoder prefers XOR-MAPPED-ADDRESS over
/// MAPPED-ADDRESS when both are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingResponse {
    pub transaction_id: TransactionId,
    pub addr: Option<SocketAddr>,
    pub other_addr: Option<SocketAddr>,
    pub error_code: u16,
    pub error_reason: String,
}

impl BindingResponse {
    pub fn success(
        transaction_id: TransactionId,
        addr: SocketAddr,
        other_addr: Option<SocketAddr>,
    ) -> Self {
        BindingResponse {
            transaction_id,
            addr: Some(addr),
            other_addr,
            error_code: 0,
            error_reason: String::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&msg_type(CLASS_SUCCESS, METHOD_BINDING).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(self.transaction_id.as_bytes());

        if let Some(addr) = self.addr {
            push_address(&mut buf, MAPPED_ADDRESS, addr);
            push_xor_address(&mut buf, addr, &self.transaction_id);
        }
        if let Some(other) = self.other_addr {
            push_address(&mut buf, OTHER_ADDRESS, other);
        }

        let length = (buf.len() - HEADER_LEN) as u16;
        buf[2..4].copy_from_slice(&length.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        let (msg_type, transaction_id) = check_header(data)?;
        if !is_success_response(msg_type) || method(msg_type) != METHOD_BINDING {
            return Err(StunError::MalformedMessage);
        }

        let mut resp = BindingResponse {
            transaction_id,
            addr: None,
            other_addr: None,
            error_code: 0,
            error_reason: String::new(),
        };
        let mut have_xor = false;
        walk_attributes(&data[HEADER_LEN..], |attr_type, value| {
            match attr_type {
                MAPPED_ADDRESS if !have_xor => {
                    resp.addr = Some(parse_address(value)?);
                }
                XOR_MAPPED_ADDRESS => {
                    resp.addr = Some(unxor_address(parse_address(value)?, &transaction_id));
                    have_xor = true;
                }
                OTHER_ADDRESS => {
                    resp.other_addr = Some(parse_address(value)?);
                }
                ERROR_CODE => {
                    if value.len() < 4 {
                        return Err(StunError::MalformedMessage);
                    }
                    resp.error_code = u16::from(value[2]) * 100 + u16::from(value[3]);
                    resp.error_reason = String::from_utf8_lossy(&value[4..]).into_owned();
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(resp)
    }
}

/// Validate the fixed 20-byte header and return the message type and
/// transaction id. The declared length must account for the whole buffer.
fn check_header(data: &[u8]) -> Result<(u16, TransactionId), StunError> {
    if data.len() < HEADER_LEN || data[0] & 0xC0 != 0 {
        return Err(StunError::MalformedMessage);
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != MAGIC_COOKIE || length % 4 != 0 || length + HEADER_LEN != data.len() {
        return Err(StunError::MalformedMessage);
    }
    let mut tid = [0u8; 12];
    tid.copy_from_slice(&data[8..HEADER_LEN]);
    Ok((msg_type, TransactionId(tid)))
}

/// Walk the attribute TLVs, handing each type and unpadded value to `visit`.
/// Attribute values are padded to 4-byte boundaries on the wire; the padding
/// is not part of the declared value length.
fn walk_attributes(
    mut body: &[u8],
    mut visit: impl FnMut(u16, &[u8]) -> Result<(), StunError>,
) -> Result<(), StunError> {
    while !body.is_empty() {
        if body.len() < 4 {
            return Err(StunError::MalformedMessage);
        }
        let attr_type = u16::from_be_bytes([body[0], body[1]]);
        let length = u16::from_be_bytes([body[2], body[3]]) as usize;
        if body.len() < 4 + length {
            return Err(StunError::MalformedMessage);
        }
        visit(attr_type, &body[4..4 + length])?;
        let advance = 4 + ((length + 3) & !3);
        body = &body[advance.min(body.len())..];
    }
    Ok(())
}

fn push_address(buf: &mut Vec<u8>, attr_type: u16, addr: SocketAddr) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.extend_from_slice(&8u16.to_be_bytes());
            buf.push(0);
            buf.push(FAMILY_IPV4);
            buf.extend_from_slice(&addr.port().to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.extend_from_slice(&20u16.to_be_bytes());
            buf.push(0);
            buf.push(FAMILY_IPV6);
            buf.extend_from_slice(&addr.port().to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
    }
}

fn push_xor_address(buf: &mut Vec<u8>, addr: SocketAddr, transaction_id: &TransactionId) {
    buf.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
    let x_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.extend_from_slice(&8u16.to_be_bytes());
            buf.push(0);
            buf.push(FAMILY_IPV4);
            buf.extend_from_slice(&x_port.to_be_bytes());
            buf.extend_from_slice(&(u32::from(ip) ^ MAGIC_COOKIE).to_be_bytes());
        }
        IpAddr::V6(ip) => {
            buf.extend_from_slice(&20u16.to_be_bytes());
            buf.push(0);
            buf.push(FAMILY_IPV6);
            buf.extend_from_slice(&x_port.to_be_bytes());
            let key = xor_key_v6(transaction_id);
            for (octet, k) in ip.octets().iter().zip(key.iter()) {
                buf.push(octet ^ k);
            }
        }
    }
}

fn parse_address(value: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() != 8 && value.len() != 20 {
        return Err(StunError::MalformedMessage);
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        FAMILY_IPV4 if value.len() == 8 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 if value.len() == 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::MalformedMessage),
    }
}

/// Undo the XOR-MAPPED-ADDRESS obfuscation: the port against the upper half
/// of the magic cookie, an IPv4 address against the cookie, an IPv6 address
/// against cookie-then-transaction-id.
fn unxor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match addr.ip() {
        IpAddr::V4(ip) => IpAddr::V4(Ipv4Addr::from(u32::from(ip) ^ MAGIC_COOKIE)),
        IpAddr::V6(ip) => {
            let key = xor_key_v6(transaction_id);
            let mut octets = ip.octets();
            for (octet, k) in octets.iter_mut().zip(key.iter()) {
                *octet ^= k;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}

fn xor_key_v6(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(seed: u8) -> TransactionId {
        TransactionId::from_bytes([seed; 12])
    }

    #[test]
    fn request_roundtrip() {
        for (change_ip, change_port) in [(false, false), (true, false), (false, true), (true, true)]
        {
            let req = BindingRequest::new().change_request(change_ip, change_port);
            let decoded = BindingRequest::decode(&req.encode()).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn request_wire_layout() {
        let req = BindingRequest::with_transaction_id(tid(7)).change_request(true, true);
        let bytes = req.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x08]);
        assert_eq!(&bytes[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&bytes[8..20], &[7u8; 12]);
        assert_eq!(&bytes[20..24], &[0x00, 0x03, 0x00, 0x04]);
        assert_eq!(&bytes[24..28], &[0x00, 0x00, 0x00, 0x06]);
    }

    #[test]
    fn response_roundtrip_v4() {
        let addr: SocketAddr = "192.0.2.1:32768".parse().unwrap();
        let other: SocketAddr = "198.51.100.9:3479".parse().unwrap();
        let resp = BindingResponse::success(tid(3), addr, Some(other));
        let decoded = BindingResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.addr, Some(addr));
        assert_eq!(decoded.other_addr, Some(other));
        assert_eq!(decoded.transaction_id, tid(3));
        assert_eq!(decoded.error_code, 0);
    }

    #[test]
    fn response_roundtrip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let resp = BindingResponse::success(tid(9), addr, None);
        let decoded = BindingResponse::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.addr, Some(addr));
        assert_eq!(decoded.other_addr, None);
    }

    #[test]
    fn header_length_invariant() {
        let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
        for other in [None, Some("203.0.113.4:3479".parse().unwrap())] {
            let bytes = BindingResponse::success(tid(1), addr, other).encode();
            let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
            assert_eq!(declared + HEADER_LEN, bytes.len());
        }
        let bytes = BindingRequest::with_transaction_id(tid(2)).encode();
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(declared + HEADER_LEN, bytes.len());
    }

    #[test]
    fn xor_roundtrip_is_transaction_independent() {
        let v4: SocketAddr = "203.0.113.7:4242".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::42]:4242".parse().unwrap();
        for seed in [0u8, 1, 0xff] {
            for addr in [v4, v6] {
                let resp = BindingResponse::success(tid(seed), addr, None);
                let decoded = BindingResponse::decode(&resp.encode()).unwrap();
                assert_eq!(decoded.addr, Some(addr));
            }
        }
    }

    #[test]
    fn xor_mapped_takes_precedence() {
        let mapped: SocketAddr = "10.0.0.1:1111".parse().unwrap();
        let xor_mapped: SocketAddr = "192.0.2.1:2222".parse().unwrap();

        // Rewrite the plain MAPPED-ADDRESS so it disagrees with the XOR copy.
        let mut bytes = BindingResponse::success(tid(5), xor_mapped, None).encode();
        let plain = &mut bytes[HEADER_LEN + 4..HEADER_LEN + 12];
        plain[2..4].copy_from_slice(&mapped.port().to_be_bytes());
        match mapped.ip() {
            IpAddr::V4(ip) => plain[4..8].copy_from_slice(&ip.octets()),
            IpAddr::V6(_) => unreachable!(),
        }
        let decoded = BindingResponse::decode(&bytes).unwrap();
        assert_eq!(decoded.addr, Some(xor_mapped));
    }

    #[test]
    fn decode_rejects_malformed() {
        let good = BindingRequest::with_transaction_id(tid(4)).encode();

        assert!(BindingRequest::decode(&good[..10]).is_err());

        let mut bad_magic = good.clone();
        bad_magic[4] = 0;
        assert!(BindingRequest::decode(&bad_magic).is_err());

        let mut bad_length = good.clone();
        bad_length[3] = 0x0c;
        assert!(BindingRequest::decode(&bad_length).is_err());

        let mut top_bits = good.clone();
        top_bits[0] |= 0xc0;
        assert!(BindingRequest::decode(&top_bits).is_err());

        // A response is not a request and vice versa.
        let resp = BindingResponse::success(tid(4), "192.0.2.1:80".parse().unwrap(), None);
        assert!(BindingRequest::decode(&resp.encode()).is_err());
        assert!(BindingResponse::decode(&good).is_err());
    }

    #[test]
    fn decode_rejects_bad_address_family() {
        let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
        let mut bytes = BindingResponse::success(tid(6), addr, None).encode();
        bytes[HEADER_LEN + 5] = 0x07;
        assert!(BindingResponse::decode(&bytes).is_err());
    }

    #[test]
    fn decode_skips_unknown_attributes() {
        let req = BindingRequest::with_transaction_id(tid(8)).change_request(false, true);
        let mut bytes = req.encode();
        // Append a SOFTWARE attribute with a padded 5-byte value.
        bytes.extend_from_slice(&[0x80, 0x22, 0x00, 0x05]);
        bytes.extend_from_slice(b"abcde\0\0\0");
        let length = (bytes.len() - HEADER_LEN) as u16;
        bytes[2..4].copy_from_slice(&length.to_be_bytes());

        let decoded = BindingRequest::decode(&bytes).unwrap();
        assert_eq!(decoded, req);
    }
}

use crate::{resolve_addr, BindingRequest, BindingResponse, StunError};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::debug;

const RETRANSMITS: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A validated binding exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// The reflexive endpoint the server saw the request arrive from.
    pub mapped_addr: SocketAddr,
    /// The server's OTHER-ADDRESS, when it advertised one.
    pub other_addr: Option<SocketAddr>,
    /// Local endpoint of the exchange, with a concrete interface IP even
    /// when the socket was bound to a wildcard address.
    pub local_addr: SocketAddr,
}

pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    pub fn new() -> Result<Self, StunError> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn bind(local: SocketAddr) -> Result<Self, StunError> {
        let socket = UdpSocket::bind(local).map_err(StunError::Bind)?;
        Ok(StunClient {
            socket,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Deadline spanning all retransmissions of a single request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StunError> {
        self.socket.local_addr().map_err(StunError::Io)
    }

    /// One-shot lookup of the public address as seen by `server`.
    pub fn get_public_address(&self, server: &str) -> Result<SocketAddr, StunError> {
        let server = resolve_addr(server)?;
        Ok(self.request(&BindingRequest::new(), server)?.mapped_addr)
    }

    pub fn request(&self, req: &BindingRequest, server: SocketAddr) -> Result<Reply, StunError> {
        self.exchange(req, server, None)
    }

    /// Like `request`, but fail with `UnexpectedSource` unless the reply's
    /// source endpoint is exactly `expected_source`.
    pub fn request_expecting(
        &self,
        req: &BindingRequest,
        server: SocketAddr,
        expected_source: SocketAddr,
    ) -> Result<Reply, StunError> {
        self.exchange(req, server, Some(expected_source))
    }

    fn exchange(
        &self,
        req: &BindingRequest,
        server: SocketAddr,
        expected_source: Option<SocketAddr>,
    ) -> Result<Reply, StunError> {
        let payload = req.encode();
        self.socket
            .set_read_timeout(Some(self.timeout / RETRANSMITS))
            .map_err(StunError::Io)?;

        let mut buf = [0u8; 1500];
        for attempt in 1..=RETRANSMITS {
            self.socket.send_to(&payload, server).map_err(StunError::Io)?;

            let (n, src) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    debug!(%server, attempt, "binding request timed out");
                    continue;
                }
                Err(err) => return Err(StunError::Io(err)),
            };

            let resp = BindingResponse::decode(&buf[..n])?;
            if let Some(expected) = expected_source {
                if src != expected {
                    return Err(StunError::UnexpectedSource(src));
                }
            }
            if resp.error_code != 0 {
                return Err(StunError::ErrorResponse {
                    code: resp.error_code,
                    reason: resp.error_reason,
                });
            }
            if resp.transaction_id != req.transaction_id {
                return Err(StunError::ProtocolMismatch);
            }
            let mapped_addr = resp.addr.ok_or(StunError::ProtocolMismatch)?;
            return Ok(Reply {
                mapped_addr,
                other_addr: resp.other_addr,
                local_addr: self.observed_local_addr(server)?,
            });
        }
        Err(StunError::Timeout)
    }

    /// The concrete local endpoint of this exchange. A wildcard-bound socket
    /// reports the interface the kernel routes toward the server, discovered
    /// by connecting a throwaway socket (no packets are sent).
    fn observed_local_addr(&self, server: SocketAddr) -> Result<SocketAddr, StunError> {
        let local = self.local_addr()?;
        if !local.ip().is_unspecified() {
            return Ok(local);
        }
        let probe = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).map_err(StunError::Io)?;
        probe.connect(server).map_err(StunError::Io)?;
        let egress = probe.local_addr().map_err(StunError::Io)?;
        Ok(SocketAddr::new(egress.ip(), local.port()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BindingResponse, TransactionId, ERROR_CODE, HEADER_LEN, MAGIC_COOKIE};
    use std::net::UdpSocket as SysUdpSocket;
    use std::thread;

    fn loopback_client() -> StunClient {
        StunClient::bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .with_timeout(Duration::from_millis(600))
    }

    /// Run `answer` on the first datagram the responder receives.
    fn spawn_responder(
        answer: impl FnOnce(&SysUdpSocket, BindingRequest, SocketAddr) + Send + 'static,
    ) -> SocketAddr {
        let socket = SysUdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 1500];
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            let req = BindingRequest::decode(&buf[..n]).unwrap();
            answer(&socket, req, peer);
        });
        addr
    }

    #[test]
    fn request_reflects_source() {
        let server = spawn_responder(|socket, req, peer| {
            let resp = BindingResponse::success(req.transaction_id, peer, None);
            socket.send_to(&resp.encode(), peer).unwrap();
        });

        let client = loopback_client();
        let reply = client.request(&BindingRequest::new(), server).unwrap();
        assert_eq!(reply.mapped_addr, client.local_addr().unwrap());
        assert_eq!(reply.local_addr, client.local_addr().unwrap());
        assert_eq!(reply.other_addr, None);
    }

    #[test]
    fn request_times_out_without_reply() {
        // Keep the socket bound so nothing answers and nothing refuses.
        let silent = SysUdpSocket::bind("127.0.0.1:0").unwrap();
        let client = loopback_client();
        let err = client
            .request(&BindingRequest::new(), silent.local_addr().unwrap())
            .unwrap_err();
        assert!(matches!(err, StunError::Timeout));
    }

    #[test]
    fn request_surfaces_error_code() {
        let server = spawn_responder(|socket, req, peer| {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&0x0101u16.to_be_bytes());
            bytes.extend_from_slice(&12u16.to_be_bytes());
            bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            bytes.extend_from_slice(req.transaction_id.as_bytes());
            bytes.extend_from_slice(&ERROR_CODE.to_be_bytes());
            bytes.extend_from_slice(&8u16.to_be_bytes());
            bytes.extend_from_slice(&[0, 0, 4, 0]);
            bytes.extend_from_slice(b"nope");
            assert_eq!(bytes.len(), HEADER_LEN + 12);
            socket.send_to(&bytes, peer).unwrap();
        });

        let client = loopback_client();
        let err = client.request(&BindingRequest::new(), server).unwrap_err();
        match err {
            StunError::ErrorResponse { code, reason } => {
                assert_eq!(code, 400);
                assert_eq!(reason, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn request_rejects_unexpected_source() {
        let server = spawn_responder(|_, req, peer| {
            let elsewhere = SysUdpSocket::bind("127.0.0.1:0").unwrap();
            let resp = BindingResponse::success(req.transaction_id, peer, None);
            elsewhere.send_to(&resp.encode(), peer).unwrap();
        });

        let client = loopback_client();
        let err = client
            .request_expecting(&BindingRequest::new(), server, server)
            .unwrap_err();
        assert!(matches!(err, StunError::UnexpectedSource(_)));
    }

    #[test]
    fn request_rejects_transaction_mismatch() {
        let server = spawn_responder(|socket, _, peer| {
            let resp = BindingResponse::success(TransactionId::from_bytes([0xaa; 12]), peer, None);
            socket.send_to(&resp.encode(), peer).unwrap();
        });

        let client = loopback_client();
        let err = client.request(&BindingRequest::new(), server).unwrap_err();
        assert!(matches!(err, StunError::ProtocolMismatch));
    }
}

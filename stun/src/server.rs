use crate::slave::{Handoff, HANDOFF_QUEUE_DEPTH};
use crate::{BindingRequest, BindingResponse, StunError, TransactionId};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// Role indices: bit 1 selects the alternate address, bit 0 the alternate
// port, so applying CHANGE-REQUEST flags is a bitwise XOR.
pub const ROLE_PP: usize = 0;
pub const ROLE_PA: usize = 1;
pub const ROLE_AP: usize = 2;
pub const ROLE_AA: usize = 3;
const ROLE_COUNT: usize = 4;

const ALT_ADDR_BIT: usize = 0b10;

const RECV_BUF_LEN: usize = 1500;

/// Role a response must be sent from after honoring CHANGE-REQUEST flags.
pub fn dispatch_role(role: usize, change_ip: bool, change_port: bool) -> usize {
    role ^ ((change_ip as usize) << 1) ^ (change_port as usize)
}

struct RoleTable {
    sockets: [Option<Arc<UdpSocket>>; ROLE_COUNT],
    /// AA endpoint advertised as OTHER-ADDRESS in plain replies from PP.
    other_addr: Option<SocketAddr>,
    /// Present in master mode: alternate-address obligations cross the
    /// slave channel instead of a local socket.
    handoff: Option<mpsc::Sender<Handoff>>,
}

pub struct StunServer {
    sockets: [Option<Arc<UdpSocket>>; ROLE_COUNT],
    other_addr: Option<SocketAddr>,
    handoff: Option<mpsc::Sender<Handoff>>,
    alt_port: u16,
}

impl StunServer {
    /// Bind the role sockets: PP and PA always, AP and AA when the host also
    /// owns the alternate address.
    pub async fn bind(
        primary: IpAddr,
        alt: Option<IpAddr>,
        primary_port: u16,
        alt_port: u16,
    ) -> Result<Self, StunError> {
        let pp = bind_role(primary, primary_port).await?;
        let pa = bind_role(primary, alt_port).await?;
        let (ap, aa, other_addr) = match alt {
            Some(ip) => (
                Some(bind_role(ip, primary_port).await?),
                Some(bind_role(ip, alt_port).await?),
                Some(SocketAddr::new(ip, alt_port)),
            ),
            None => (None, None, None),
        };
        Ok(StunServer {
            sockets: [Some(pp), Some(pa), ap, aa],
            other_addr,
            handoff: None,
            alt_port,
        })
    }

    /// Switch a two-socket table into the master half of a split deployment:
    /// the alternate address lives on the partner host, so advertise its AA
    /// endpoint and queue redirected responses for the slave channel.
    pub fn partner(&mut self, slave_ip: IpAddr) -> mpsc::Receiver<Handoff> {
        let (tx, rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
        self.other_addr = Some(SocketAddr::new(slave_ip, self.alt_port));
        self.handoff = Some(tx);
        rx
    }

    pub fn socket(&self, role: usize) -> Option<Arc<UdpSocket>> {
        self.sockets.get(role).and_then(Clone::clone)
    }

    pub fn local_addr(&self, role: usize) -> Option<SocketAddr> {
        self.socket(role).and_then(|socket| socket.local_addr().ok())
    }

    /// Run one receive loop per bound role. Does not return under normal
    /// operation.
    pub async fn run(self) -> Result<(), StunError> {
        let table = Arc::new(RoleTable {
            sockets: self.sockets,
            other_addr: self.other_addr,
            handoff: self.handoff,
        });

        let mut loops = Vec::new();
        for role in 0..ROLE_COUNT {
            if let Some(socket) = table.sockets[role].clone() {
                loops.push(tokio::spawn(role_loop(role, socket, table.clone())));
            }
        }
        for handle in loops {
            handle
                .await
                .map_err(|err| StunError::Io(io::Error::new(io::ErrorKind::Other, err)))?;
        }
        Ok(())
    }
}

async fn bind_role(ip: IpAddr, port: u16) -> Result<Arc<UdpSocket>, StunError> {
    let socket = UdpSocket::bind(SocketAddr::new(ip, port))
        .await
        .map_err(StunError::Bind)?;
    Ok(Arc::new(socket))
}

async fn role_loop(role: usize, socket: Arc<UdpSocket>, table: Arc<RoleTable>) {
    let mut buf = [0u8; RECV_BUF_LEN];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(role, error = %err, "receive failed");
                continue;
            }
        };
        let req = match BindingRequest::decode(&buf[..n]) {
            Ok(req) => req,
            Err(err) => {
                debug!(role, peer = %peer, error = %err, "dropping undecodable datagram");
                continue;
            }
        };

        let reply_role = dispatch_role(role, req.change_ip, req.change_port);
        if reply_role == role {
            let advertised = if role == ROLE_PP { table.other_addr } else { None };
            respond(&socket, peer, req.transaction_id, advertised).await;
        } else if let Some(reply_socket) = &table.sockets[reply_role] {
            respond(reply_socket, peer, req.transaction_id, None).await;
        } else if let Some(handoff) = table
            .handoff
            .as_ref()
            .filter(|_| reply_role & ALT_ADDR_BIT != 0)
        {
            let record = Handoff {
                client: peer,
                transaction_id: req.transaction_id,
            };
            if let Err(err) = handoff.try_send(record) {
                warn!(peer = %peer, error = %err, "dropping handoff record");
            }
        } else {
            debug!(role, reply_role, peer = %peer, "no socket for requested role, dropping");
        }
    }
}

pub(crate) async fn respond(
    socket: &UdpSocket,
    peer: SocketAddr,
    transaction_id: TransactionId,
    other_addr: Option<SocketAddr>,
) {
    let resp = BindingResponse::success(transaction_id, peer, other_addr);
    if let Err(err) = socket.send_to(&resp.encode(), peer).await {
        warn!(peer = %peer, error = %err, "failed to send binding response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_role_covers_the_matrix() {
        for role in [ROLE_PP, ROLE_PA, ROLE_AP, ROLE_AA] {
            assert_eq!(dispatch_role(role, false, false), role);
            assert_eq!(dispatch_role(role, false, true), role ^ 0b01);
            assert_eq!(dispatch_role(role, true, false), role ^ 0b10);
            assert_eq!(dispatch_role(role, true, true), role ^ 0b11);
        }
        // CHANGE-REQUEST{ip,port} from PP lands on AA and is an involution.
        assert_eq!(dispatch_role(ROLE_PP, true, true), ROLE_AA);
        assert_eq!(dispatch_role(ROLE_AA, true, true), ROLE_PP);
    }
}

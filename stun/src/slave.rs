//! TCP side channel between the master STUN server (primary address) and the
//! slave host holding the alternate address. The master forwards response
//! obligations as newline-terminated `ip:port|hex-txid` records; the slave
//! turns each record into an immediate binding success response. There is no
//! acknowledgment: a dropped record is covered by the client's own
//! retransmission.

use crate::server::respond;
use crate::{StunError, TransactionId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outstanding records the master will queue before dropping new ones.
pub const HANDOFF_QUEUE_DEPTH: usize = 128;

/// Read-buffer size for records; longer lines are truncated to this before
/// parsing. Valid content stays well below it.
pub const MAX_RECORD_LEN: usize = 128;

const REDIAL_DELAY: Duration = Duration::from_secs(1);

/// A response obligation forwarded across the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handoff {
    pub client: SocketAddr,
    pub transaction_id: TransactionId,
}

impl Handoff {
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}\n",
            self.client,
            hex::encode(self.transaction_id.as_bytes())
        )
    }

    /// Parse a record without its trailing newline. Wrong field counts,
    /// non-hex or non-12-byte transaction ids, and unparseable endpoints all
    /// yield `None`.
    pub fn parse(line: &str) -> Option<Handoff> {
        let (addr, tid_hex) = line.split_once('|')?;
        let client: SocketAddr = addr.parse().ok()?;
        let tid: [u8; 12] = hex::decode(tid_hex).ok()?.try_into().ok()?;
        Some(Handoff {
            client,
            transaction_id: TransactionId::from_bytes(tid),
        })
    }
}

/// Master half: drain the handoff queue into a persistent connection to the
/// slave, redialing on connect or write failure. Records stay in FIFO order;
/// one record is lost per broken write.
pub async fn run_master(slave: SocketAddr, mut handoffs: mpsc::Receiver<Handoff>) {
    loop {
        let mut stream = match TcpStream::connect(slave).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(slave = %slave, error = %err, "slave channel dial failed, retrying");
                tokio::time::sleep(REDIAL_DELAY).await;
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "set_nodelay failed");
        }
        info!(slave = %slave, "slave channel connected");

        loop {
            let handoff = match handoffs.recv().await {
                Some(handoff) => handoff,
                None => return,
            };
            if let Err(err) = stream.write_all(handoff.to_line().as_bytes()).await {
                warn!(slave = %slave, error = %err, "slave channel write failed, redialing");
                tokio::time::sleep(REDIAL_DELAY).await;
                break;
            }
        }
    }
}

/// Slave half: accept master connections on `listener` and emit every
/// forwarded record as a binding success response from `socket`, which the
/// caller binds to the endpoint the master advertises as AA.
pub async fn run_slave(listener: TcpListener, socket: Arc<UdpSocket>) {
    loop {
        let (stream, master) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "slave channel accept failed");
                continue;
            }
        };
        info!(master = %master, "master connected");
        tokio::spawn(serve_master(stream, socket.clone()));
    }
}

/// Bind the slave channel listener; `Bind` failures are fatal at startup.
pub async fn listen(addr: SocketAddr) -> Result<TcpListener, StunError> {
    TcpListener::bind(addr).await.map_err(StunError::Bind)
}

async fn serve_master(stream: TcpStream, socket: Arc<UdpSocket>) {
    let mut lines = BufReader::with_capacity(MAX_RECORD_LEN, stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("master closed the slave channel");
                return;
            }
            Err(err) => {
                warn!(error = %err, "slave channel read failed");
                return;
            }
        };
        let line = truncate_record(line);
        let handoff = match Handoff::parse(&line) {
            Some(handoff) => handoff,
            None => {
                warn!(record = %line, "skipping malformed record");
                continue;
            }
        };
        debug!(client = %handoff.client, "emitting redirected response");
        respond(&socket, handoff.client, handoff.transaction_id, None).await;
    }
}

/// Cap a record at the read-buffer size before parsing. The line itself has
/// already been consumed in full, so the stream stays newline-aligned.
fn truncate_record(mut line: String) -> String {
    if line.len() > MAX_RECORD_LEN {
        let mut cut = MAX_RECORD_LEN;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        warn!(len = line.len(), "truncating oversized record");
        line.truncate(cut);
    }
    line
}

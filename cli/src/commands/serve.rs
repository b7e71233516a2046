use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr};
use stun::server::{StunServer, ROLE_PA};
use stun::{resolve_addr, slave};
use tracing::{info, warn};

pub struct ServeArgs {
    pub primary_addr: String,
    pub alt_addr: String,
    pub primary_port: u16,
    pub alt_port: u16,
    pub slave_server: Option<String>,
    pub slave: bool,
    pub public: bool,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let (primary, alt) = server_addresses(&args)?;

    if args.slave {
        let server =
            StunServer::bind(primary, None, args.primary_port, args.alt_port).await?;
        info!(
            primary = %primary,
            primary_port = args.primary_port,
            alt_port = args.alt_port,
            "slave STUN server listening"
        );
        match &args.slave_server {
            Some(listen) => {
                let listener = slave::listen(resolve_addr(listen)?).await?;
                let socket = server
                    .socket(ROLE_PA)
                    .context("alternate-port socket not bound")?;
                tokio::spawn(slave::run_slave(listener, socket));
            }
            None => warn!("no --slave-server listen address; running without a master link"),
        }
        server.run().await?;
    } else if let Some(alt) = alt {
        let server =
            StunServer::bind(primary, Some(alt), args.primary_port, args.alt_port).await?;
        info!(primary = %primary, alt = %alt, "dual-address STUN server listening");
        server.run().await?;
    } else if let Some(slave_server) = &args.slave_server {
        let slave_addr = resolve_addr(slave_server)?;
        let mut server =
            StunServer::bind(primary, None, args.primary_port, args.alt_port).await?;
        let handoffs = server.partner(slave_addr.ip());
        info!(primary = %primary, slave = %slave_addr, "master STUN server listening");
        tokio::spawn(slave::run_master(slave_addr, handoffs));
        server.run().await?;
    } else {
        warn!("no alternative address or slave peer; CHANGE-REQUEST probes will go unanswered");
        let server =
            StunServer::bind(primary, None, args.primary_port, args.alt_port).await?;
        info!(primary = %primary, "single-address STUN server listening");
        server.run().await?;
    }
    Ok(())
}

/// Resolve the primary and alternative server addresses, filling blanks from
/// the host's non-loopback IPv4 interfaces. In slave mode the alternative
/// address is always left to the master's side of the matrix.
fn server_addresses(args: &ServeArgs) -> Result<(IpAddr, Option<IpAddr>)> {
    let mut primary = parse_addr(&args.primary_addr)?;
    let mut alt = if args.slave {
        None
    } else {
        parse_addr(&args.alt_addr)?
    };

    if primary.is_none() || (!args.slave && alt.is_none()) {
        for ip in detect_ipv4(args.public)? {
            let ip = IpAddr::V4(ip);
            if primary.is_none() {
                primary = Some(ip);
            } else if !args.slave && alt.is_none() && primary != Some(ip) {
                alt = Some(ip);
            }
        }
    }

    let primary = primary.context("no usable IPv4 address found; pass --primary-addr")?;
    Ok((primary, alt))
}

fn parse_addr(addr: &str) -> Result<Option<IpAddr>> {
    if addr.is_empty() {
        return Ok(None);
    }
    let ip = addr
        .parse::<IpAddr>()
        .with_context(|| format!("invalid address {}", addr))?;
    Ok(Some(ip))
}

fn detect_ipv4(public_only: bool) -> Result<Vec<Ipv4Addr>> {
    let mut candidates = Vec::new();
    for iface in get_if_addrs::get_if_addrs().context("interface enumeration failed")? {
        let ip = match iface.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => continue,
        };
        if ip.is_loopback() || (public_only && ip.is_private()) {
            continue;
        }
        if !candidates.contains(&ip) {
            candidates.push(ip);
        }
    }
    Ok(candidates)
}

use anyhow::{Context, Result};
use nat::Discovery;
use std::net::{IpAddr, UdpSocket};

pub fn run(server: &str, alt_server: Option<&str>, local: Option<&str>, json: bool) -> Result<()> {
    let local = match local {
        Some(local) => local.to_string(),
        None => {
            let ip = egress_ip().context("could not auto-detect a local address, pass --local")?;
            format!("{}:0", ip)
        }
    };

    let mut discovery = Discovery::new(&local, server);
    if let Some(alt) = alt_server {
        discovery = discovery.alt_server(alt);
    }
    let report = discovery.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

/// The interface IP the OS routes outbound traffic through, found by
/// connecting a throwaway UDP socket to a public address (no packets are
/// sent).
fn egress_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    Ok(socket.local_addr()?.ip())
}

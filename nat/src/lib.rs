//! NAT behavior discovery over STUN binding requests, following the RFC 5780
//! test sequence: three mapping tests, three filtering tests, and a
//! hairpinning probe. All mapping and filtering tests share one socket so
//! the NAT binding under observation stays alive; hairpinning uses a fresh
//! ephemeral-port socket on the same local IP.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use stun::client::StunClient;
use stun::{resolve_addr, BindingRequest, StunError};
use tracing::{debug, info};

/// How a NAT maps one internal endpoint across outbound destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingType {
    /// The reflexive address equals the local address.
    NoNat,
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
    /// The server offered no alternative endpoint to test against.
    Failed,
}

/// Which inbound packets a NAT lets back through an established mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilteringType {
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
    Failed,
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MappingType::NoNat => "no NAT",
            MappingType::EndpointIndependent => "endpoint-independent mapping",
            MappingType::AddressDependent => "address-dependent mapping",
            MappingType::AddressAndPortDependent => "address and port-dependent mapping",
            MappingType::Failed => "test failed",
        };
        f.write_str(text)
    }
}

impl fmt::Display for FilteringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FilteringType::EndpointIndependent => "endpoint-independent filtering",
            FilteringType::AddressDependent => "address-dependent filtering",
            FilteringType::AddressAndPortDependent => "address and port-dependent filtering",
            FilteringType::Failed => "test failed",
        };
        f.write_str(text)
    }
}

/// Outcome of a discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatReport {
    pub local_addr: SocketAddr,
    /// Reflexive endpoint observed at the server's primary role.
    pub mapped_addr: SocketAddr,
    pub mapping: MappingType,
    /// `None` when the filtering tests never ran (no NAT detected).
    pub filtering: Option<FilteringType>,
    pub hairpinning: bool,
}

impl fmt::Display for NatReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "local address:  {}", self.local_addr)?;
        writeln!(f, "mapped address: {}", self.mapped_addr)?;
        if self.mapping == MappingType::NoNat {
            writeln!(f, "NAT type: no NAT")?;
        } else {
            writeln!(f, "NAT mapping type: {}", self.mapping)?;
        }
        if let Some(filtering) = self.filtering {
            writeln!(f, "NAT filtering type: {}", filtering)?;
        }
        write!(
            f,
            "hairpinning support: {}",
            if self.hairpinning { "yes" } else { "no" }
        )
    }
}

/// Configured discovery run.
pub struct Discovery {
    local: String,
    server: String,
    alt_server: Option<String>,
    timeout: Duration,
}

/// Run a discovery with the default per-request timeout.
pub fn discover(
    local: &str,
    server: &str,
    alt_server: Option<&str>,
) -> Result<NatReport, StunError> {
    let mut discovery = Discovery::new(local, server);
    if let Some(alt) = alt_server {
        discovery = discovery.alt_server(alt);
    }
    discovery.run()
}

impl Discovery {
    pub fn new(local: &str, server: &str) -> Self {
        Discovery {
            local: local.to_string(),
            server: server.to_string(),
            alt_server: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Fallback alternative server for the mapping tests, used when the
    /// primary server does not advertise OTHER-ADDRESS. The filtering tests
    /// still require the server's own advertisement.
    pub fn alt_server(mut self, alt_server: &str) -> Self {
        self.alt_server = Some(alt_server.to_string());
        self
    }

    /// Per-request deadline spanning that request's retransmissions.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run(&self) -> Result<NatReport, StunError> {
        let server = resolve_addr(&self.server)?;
        let alt_server = self.alt_server.as_deref().map(resolve_addr).transpose()?;
        let local = resolve_addr(&self.local)?;
        let client = StunClient::bind(local)?.with_timeout(self.timeout);

        // Mapping test I: does the server see us at our bound address?
        let first = client.request(&BindingRequest::new(), server)?;
        let mapped_pp = first.mapped_addr;
        info!(local = %first.local_addr, mapped = %mapped_pp, "mapping test I");
        if first.local_addr == mapped_pp {
            return Ok(NatReport {
                local_addr: first.local_addr,
                mapped_addr: mapped_pp,
                mapping: MappingType::NoNat,
                filtering: None,
                hairpinning: false,
            });
        }

        let alternative = first.other_addr;
        let mapping = classify_mapping(&client, server, mapped_pp, alternative.or(alt_server))?;

        // CHANGE-REQUEST needs the server's cooperation, so the filtering
        // tests only run against a server that advertised an alternative.
        let filtering = Some(match alternative {
            Some(alternative) => classify_filtering(&client, server, alternative),
            None => {
                debug!("server advertised no OTHER-ADDRESS, skipping filtering tests");
                FilteringType::Failed
            }
        });

        let hairpinning = probe_hairpinning(first.local_addr, mapped_pp, self.timeout);

        Ok(NatReport {
            local_addr: first.local_addr,
            mapped_addr: mapped_pp,
            mapping,
            filtering,
            hairpinning,
        })
    }
}

fn classify_mapping(
    client: &StunClient,
    server: SocketAddr,
    mapped_pp: SocketAddr,
    alternative: Option<SocketAddr>,
) -> Result<MappingType, StunError> {
    let alt = match alternative {
        Some(alt) => alt,
        None => {
            debug!("no alternative endpoint, skipping mapping tests II/III");
            return Ok(MappingType::Failed);
        }
    };

    // Test II: alternate address, primary port.
    let target = SocketAddr::new(alt.ip(), server.port());
    let second = client.request(&BindingRequest::new(), target)?;
    info!(mapped = %second.mapped_addr, "mapping test II");
    if second.mapped_addr == mapped_pp {
        return Ok(MappingType::EndpointIndependent);
    }

    // Test III: alternate address and port.
    let third = client.request(&BindingRequest::new(), alt)?;
    info!(mapped = %third.mapped_addr, "mapping test III");
    if third.mapped_addr == second.mapped_addr {
        Ok(MappingType::AddressDependent)
    } else {
        Ok(MappingType::AddressAndPortDependent)
    }
}

fn classify_filtering(
    client: &StunClient,
    server: SocketAddr,
    alternative: SocketAddr,
) -> FilteringType {
    // Test II: ask for the reply from the alternate address and port. Any
    // usable reply means inbound packets pass regardless of source.
    let req = BindingRequest::new().change_request(true, true);
    match client.request(&req, server) {
        Ok(_) => return FilteringType::EndpointIndependent,
        Err(err) => debug!(error = %err, "filtering test II got no usable reply"),
    }

    // Test III: alternate port only; the reply must come from the primary
    // address. A reply from anywhere else is an inconsistent result rather
    // than evidence either way.
    let req = BindingRequest::new().change_request(false, true);
    let expected = SocketAddr::new(server.ip(), alternative.port());
    match client.request_expecting(&req, server, expected) {
        Ok(_) => FilteringType::AddressDependent,
        Err(StunError::UnexpectedSource(src)) => {
            debug!(src = %src, "filtering test III reply from unexpected source");
            FilteringType::Failed
        }
        Err(err) => {
            debug!(error = %err, "filtering test III got no reply");
            FilteringType::AddressAndPortDependent
        }
    }
}

/// Send a plain binding request from a fresh socket to our own public
/// mapping; any successful reply means the NAT loops it back inside.
fn probe_hairpinning(local: SocketAddr, mapped: SocketAddr, timeout: Duration) -> bool {
    let probe = match StunClient::bind(SocketAddr::new(local.ip(), 0)) {
        Ok(client) => client.with_timeout(timeout),
        Err(err) => {
            debug!(error = %err, "hairpinning probe bind failed");
            return false;
        }
    };
    match probe.request(&BindingRequest::new(), mapped) {
        Ok(_) => true,
        Err(err) => {
            debug!(error = %err, "hairpinning probe got no reply");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(mapping: MappingType, filtering: Option<FilteringType>) -> NatReport {
        NatReport {
            local_addr: "192.168.1.5:40000".parse().unwrap(),
            mapped_addr: "203.0.113.9:31000".parse().unwrap(),
            mapping,
            filtering,
            hairpinning: true,
        }
    }

    #[test]
    fn report_lists_both_classifications() {
        let rendered = report(
            MappingType::EndpointIndependent,
            Some(FilteringType::AddressDependent),
        )
        .to_string();
        assert_eq!(
            rendered,
            "local address:  192.168.1.5:40000\n\
             mapped address: 203.0.113.9:31000\n\
             NAT mapping type: endpoint-independent mapping\n\
             NAT filtering type: address-dependent filtering\n\
             hairpinning support: yes"
        );
    }

    #[test]
    fn report_collapses_no_nat() {
        let rendered = report(MappingType::NoNat, None).to_string();
        assert!(rendered.contains("NAT type: no NAT"));
        assert!(!rendered.contains("filtering"));
    }

    #[test]
    fn report_serializes() {
        let json =
            serde_json::to_string(&report(MappingType::Failed, Some(FilteringType::Failed)))
                .unwrap();
        assert!(json.contains("\"mapping\":\"Failed\""));
        let parsed: NatReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.mapping, MappingType::Failed);
    }
}

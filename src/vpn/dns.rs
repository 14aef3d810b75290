//! Hostname lookups against the VPN's own nameservers
//!
//! Queries go straight to the servers handed to us by the VPN client over
//! UDP, bypassing the system resolver (which may not know about them yet).

use crate::platform::DnsProvider;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::ProtoError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed DNS message: {0}")]
    Proto(#[from] ProtoError),
    #[error("Server answered {0}")]
    ResponseCode(ResponseCode),
    #[error("Response ID {got} does not match query ID {expected}")]
    IdMismatch { expected: u16, got: u16 },
}

pub struct VpnDnsResolver {
    port: u16,
    timeout: Duration,
}

impl VpnDnsResolver {
    pub fn new() -> Self {
        Self {
            port: DNS_PORT,
            timeout: DNS_TIMEOUT,
        }
    }

    /// Resolver for servers listening on a non-standard port
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::new()
        }
    }

    /// Send one A query for `name` to `server` and collect the addresses
    fn query(
        &self,
        name: &str,
        server: IpAddr,
        bind_address: Option<IpAddr>,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let local = match (bind_address, server) {
            (Some(bind), server) if bind.is_ipv4() == server.is_ipv4() => SocketAddr::new(bind, 0),
            (_, IpAddr::V4(_)) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            (_, IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.connect(SocketAddr::new(server, self.port))?;

        let id = query_id();
        socket.send(&build_query(name, id)?)?;

        let mut response = [0u8; MAX_UDP_RESPONSE_SIZE];
        let len = socket.recv(&mut response)?;
        parse_response(&response[..len], id)
    }
}

impl Default for VpnDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsProvider for VpnDnsResolver {
    fn lookup_host(
        &self,
        hostname: &str,
        dns_servers: &[IpAddr],
        search_domains: &[String],
        bind_address: Option<IpAddr>,
    ) -> Option<Vec<IpAddr>> {
        if dns_servers.is_empty() {
            warn!("No VPN DNS servers to look up {} with", hostname);
            return None;
        }

        for candidate in candidate_names(hostname, search_domains) {
            for &server in dns_servers {
                debug!("Querying {} for {}", server, candidate);
                match self.query(&candidate, server, bind_address) {
                    Ok(ips) if !ips.is_empty() => {
                        info!("VPN DNS resolved {} -> {:?} (via {})", candidate, ips, server);
                        return Some(ips);
                    }
                    Ok(_) => debug!("{} has no address records on {}", candidate, server),
                    Err(e) => debug!("DNS query to {} for {} failed: {}", server, candidate, e),
                }
            }
        }

        None
    }
}

/// Names to try, in order. Dotless names are qualified with each search
/// domain first; dotted names are tried as given first.
fn candidate_names(hostname: &str, search_domains: &[String]) -> Vec<String> {
    let hostname = hostname.trim_end_matches('.');
    let qualified = search_domains
        .iter()
        .map(|domain| format!("{}.{}", hostname, domain.trim_matches('.')));

    if hostname.contains('.') {
        std::iter::once(hostname.to_string()).chain(qualified).collect()
    } else {
        qualified.chain(std::iter::once(hostname.to_string())).collect()
    }
}

fn query_id() -> u16 {
    (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        & 0xFFFF) as u16
}

/// Build a recursive A query for `name`
fn build_query(name: &str, id: u16) -> Result<Vec<u8>, DnsError> {
    let fqdn = Name::from_str(&format!("{}.", name.trim_end_matches('.')))?;

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(fqdn, RecordType::A));

    Ok(message.to_vec()?)
}

/// Extract the addresses from a response. NXDOMAIN is an empty answer
/// rather than an error so the next candidate name gets tried.
fn parse_response(bytes: &[u8], expected_id: u16) -> Result<Vec<IpAddr>, DnsError> {
    let message = Message::from_vec(bytes)?;

    if message.id() != expected_id {
        return Err(DnsError::IdMismatch {
            expected: expected_id,
            got: message.id(),
        });
    }

    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Ok(Vec::new()),
        code => return Err(DnsError::ResponseCode(code)),
    }

    Ok(message
        .answers()
        .iter()
        .filter_map(|answer| match answer.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect())
}

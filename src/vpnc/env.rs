//! vpnc-script environment variable parsing
//!
//! When a VPN client such as OpenConnect invokes us as its vpnc-script, it
//! describes the session through environment variables. This module turns
//! them into a typed, immutable [`SessionEnv`].
//!
//! # Key Variables
//!
//! | Variable | Example | Description |
//! |----------|---------|-------------|
//! | `reason` | `connect` | Lifecycle event |
//! | `TUNDEV` | `tun0` | Tunnel device name |
//! | `VPNGATEWAY` | `203.0.113.7` | VPN gateway IP |
//! | `INTERNAL_IP4_ADDRESS` | `10.0.0.100` | Client's VPN IP |
//! | `INTERNAL_IP4_DNS` | `10.0.0.2 10.0.0.3` | VPN DNS server(s) |
//! | `INTERNAL_IP4_NETADDR` | `10.0.0.0` | VPN network address |
//! | `INTERNAL_IP4_NETMASK` | `255.255.255.0` | VPN netmask |
//! | `INTERNAL_IP4_NETMASKLEN` | `24` | VPN prefix length |
//! | `CISCO_SPLIT_INC` | `2` | Number of split-include networks |
//! | `CISCO_SPLIT_INC_0_ADDR` | `10.1.0.0` | ... and their address/mask/length |

use ipnet::{ipv6_mask_to_prefix, IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Must be called as vpnc-script, with $reason set")]
    MissingReason,
    #[error("Unknown reason: {0}")]
    UnknownReason(String),
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {var}={value:?}: {source}")]
    Invalid {
        var: String,
        value: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "Netmask supplied in {mask_var} ({netmask}) does not match the {prefix_len}-bit prefix \
         of the network address {address} ({derived} != {netmask})"
    )]
    NetmaskMismatch {
        mask_var: String,
        netmask: Ipv4Addr,
        prefix_len: u8,
        address: Ipv4Addr,
        derived: Ipv4Addr,
    },
}

impl EnvError {
    /// Missing or unknown lifecycle reason, as opposed to a bad session description
    pub fn is_usage_error(&self) -> bool {
        matches!(self, EnvError::MissingReason | EnvError::UnknownReason(_))
    }
}

/// The reason the VPN client is invoking the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Before the tunnel device is created
    PreInit,
    /// Tunnel established, configure routing
    Connect,
    /// VPN shutting down, cleanup
    Disconnect,
    /// VPN reconnected after brief disconnect
    Reconnect,
    /// VPN is about to try reconnecting
    AttemptReconnect,
}

impl FromStr for Reason {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "pre_init" => Ok(Reason::PreInit),
            "connect" => Ok(Reason::Connect),
            "disconnect" => Ok(Reason::Disconnect),
            "reconnect" => Ok(Reason::Reconnect),
            "attempt_reconnect" => Ok(Reason::AttemptReconnect),
            _ => Err(EnvError::UnknownReason(s.to_string())),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reason::PreInit => "pre-init",
            Reason::Connect => "connect",
            Reason::Disconnect => "disconnect",
            Reason::Reconnect => "reconnect",
            Reason::AttemptReconnect => "attempt-reconnect",
        };
        f.write_str(name)
    }
}

/// Every vpnc-script variable we recognize and the field it feeds.
/// The indexed `CISCO_SPLIT_{INC,EXC}_n_*` variables are read per count.
pub const VARIABLES: &[(&str, &str)] = &[
    ("reason", "reason"),
    ("VPNGATEWAY", "gateway"),
    ("TUNDEV", "tunnel_device"),
    ("CISCO_DEF_DOMAIN", "search_domains"),
    ("CISCO_BANNER", "banner"),
    ("INTERNAL_IP4_ADDRESS", "my_address"),
    ("INTERNAL_IP4_MTU", "mtu"),
    ("INTERNAL_IP4_NETMASK", "network"),
    ("INTERNAL_IP4_NETMASKLEN", "network"),
    ("INTERNAL_IP4_NETADDR", "network"),
    ("INTERNAL_IP4_DNS", "dns_servers"),
    ("INTERNAL_IP4_NBNS", "nbns_servers"),
    ("INTERNAL_IP6_ADDRESS", "my_address6"),
    ("INTERNAL_IP6_NETMASK", "network6"),
    ("INTERNAL_IP6_DNS", "dns6_servers"),
    ("CISCO_SPLIT_INC", "split_include"),
    ("CISCO_SPLIT_EXC", "split_exclude"),
    ("CISCO_IPV6_SPLIT_INC", "split_include6"),
    ("CISCO_IPV6_SPLIT_EXC", "split_exclude6"),
];

/// Something in the environment we recognize but cannot fully honor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvWarning {
    Ipv6AddressOrNetmask,
    Ipv6DnsServers,
    Ipv6SplitVariables,
}

impl fmt::Display for EnvWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvWarning::Ipv6AddressOrNetmask => f.write_str(
                "IPv6 address or netmask set, but IPv6 support is only rudimentary",
            ),
            EnvWarning::Ipv6DnsServers => {
                f.write_str("IPv6 DNS servers set, but they are not used for lookups or routes")
            }
            EnvWarning::Ipv6SplitVariables => {
                f.write_str("CISCO_IPV6_SPLIT_* environment variables set, but they are ignored")
            }
        }
    }
}

/// Parsed vpnc-script session description
#[derive(Debug, Clone)]
pub struct SessionEnv {
    /// Lifecycle event
    pub reason: Reason,
    /// VPN gateway IP address
    pub gateway: Option<IpAddr>,
    /// Tunnel device name (e.g., "utun9" on macOS, "tun0" on Linux)
    pub tunnel_device: Option<String>,
    pub search_domains: Vec<String>,
    /// Connect banner from the VPN concentrator
    pub banner: Option<String>,
    /// Client's assigned VPN IPv4 address
    pub my_address: Option<Ipv4Addr>,
    pub mtu: Option<u32>,
    pub netmask: Option<Ipv4Addr>,
    /// The VPN's own IPv4 subnet
    pub network: Option<Ipv4Net>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub nbns_servers: Vec<Ipv4Addr>,
    /// Client's assigned VPN IPv6 address, without its prefix
    pub my_address6: Option<Ipv6Addr>,
    /// The VPN's own IPv6 subnet
    pub network6: Option<Ipv6Net>,
    pub netmask6_set: bool,
    pub dns6_servers: Vec<Ipv6Addr>,
    pub split_include: Vec<Ipv4Net>,
    pub split_exclude: Vec<Ipv4Net>,
    pub split_include6_count: usize,
    pub split_exclude6_count: usize,
    ipv6_split_vars: bool,
}

/// Parse one optional variable, naming it and its raw value on failure
fn field<T, E, F>(vars: &HashMap<String, String>, var: &str, parse: F) -> Result<Option<T>, EnvError>
where
    F: FnOnce(&str) -> Result<T, E>,
    E: Into<BoxError>,
{
    match vars.get(var) {
        None => Ok(None),
        Some(value) => parse(value.trim()).map(Some).map_err(|e| EnvError::Invalid {
            var: var.to_string(),
            value: value.clone(),
            source: e.into(),
        }),
    }
}

fn required<T, E, F>(vars: &HashMap<String, String>, var: &str, parse: F) -> Result<T, EnvError>
where
    F: FnOnce(&str) -> Result<T, E>,
    E: Into<BoxError>,
{
    field(vars, var, parse)?.ok_or_else(|| EnvError::MissingVar(var.to_string()))
}

fn parse_list<T: FromStr>(s: &str) -> Result<Vec<T>, T::Err> {
    s.split_whitespace().map(str::parse).collect()
}

/// An IPv6 address with an optional `/prefix`, as in `INTERNAL_IP6_ADDRESS`
fn parse_ipv6_interface(s: &str) -> Result<Ipv6Net, BoxError> {
    if s.contains('/') {
        Ok(s.parse::<Ipv6Net>()?)
    } else {
        Ok(Ipv6Net::from(s.parse::<Ipv6Addr>()?))
    }
}

/// `INTERNAL_IP6_NETMASK` is either `addr/prefix` or a bare mask like `ffff:ffff::`
fn parse_ipv6_netmask(s: &str) -> Result<u8, BoxError> {
    if s.contains('/') {
        Ok(s.parse::<Ipv6Net>()?.prefix_len())
    } else {
        Ok(ipv6_mask_to_prefix(s.parse::<Ipv6Addr>()?)?)
    }
}

/// Rebuild an IPv4 network from its address and prefix length, and check it
/// against the separately supplied netmask.
fn reconstruct_network(
    address: Ipv4Addr,
    prefix_len: u8,
    netmask: Option<Ipv4Addr>,
    len_var: &str,
    mask_var: &str,
) -> Result<Ipv4Net, EnvError> {
    let network = Ipv4Net::new(address, prefix_len)
        .map_err(|e| EnvError::Invalid {
            var: len_var.to_string(),
            value: prefix_len.to_string(),
            source: e.into(),
        })?
        .trunc();

    if let Some(netmask) = netmask {
        if network.netmask() != netmask {
            return Err(EnvError::NetmaskMismatch {
                mask_var: mask_var.to_string(),
                netmask,
                prefix_len,
                address,
                derived: network.netmask(),
            });
        }
    }

    Ok(network)
}

/// Read the `CISCO_SPLIT_{kind}_n_{ADDR,MASK,MASKLEN}` triplets for `count` entries
fn parse_splits(
    vars: &HashMap<String, String>,
    kind: &str,
    count: usize,
) -> Result<Vec<Ipv4Net>, EnvError> {
    (0..count)
        .map(|n| {
            let prefix = format!("CISCO_SPLIT_{}_{}", kind, n);
            let addr_var = format!("{}_ADDR", prefix);
            let mask_var = format!("{}_MASK", prefix);
            let len_var = format!("{}_MASKLEN", prefix);

            let address: Ipv4Addr = required(vars, &addr_var, str::parse)?;
            let netmask: Ipv4Addr = required(vars, &mask_var, str::parse)?;
            let prefix_len: u8 = required(vars, &len_var, str::parse)?;

            reconstruct_network(address, prefix_len, Some(netmask), &len_var, &mask_var)
        })
        .collect()
}

/// Snapshot of the current process environment. Non-UTF-8 values are
/// converted lossily rather than dropped, so a mangled banner still shows up.
pub fn process_vars() -> HashMap<String, String> {
    std::env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .collect()
}

impl SessionEnv {

    /// Parse a snapshot of environment variables
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, EnvError> {
        let reason: Reason = vars
            .get("reason")
            .ok_or(EnvError::MissingReason)?
            .trim()
            .parse()?;

        let gateway = field(&vars, "VPNGATEWAY", str::parse::<IpAddr>)?;
        let tunnel_device = field(&vars, "TUNDEV", |s| Ok::<_, BoxError>(s.to_string()))?
            .filter(|s| !s.is_empty());

        if matches!(reason, Reason::Connect | Reason::Disconnect) {
            if gateway.is_none() {
                return Err(EnvError::MissingVar("VPNGATEWAY".into()));
            }
            if tunnel_device.is_none() {
                return Err(EnvError::MissingVar("TUNDEV".into()));
            }
        }

        let search_domains: Vec<String> = field(&vars, "CISCO_DEF_DOMAIN", |s| {
            Ok::<_, BoxError>(s.split_whitespace().map(str::to_string).collect())
        })?
        .unwrap_or_default();
        let banner = vars.get("CISCO_BANNER").cloned();

        let my_address = field(&vars, "INTERNAL_IP4_ADDRESS", str::parse::<Ipv4Addr>)?;
        let mtu = field(&vars, "INTERNAL_IP4_MTU", str::parse::<u32>)?;
        let netmask = field(&vars, "INTERNAL_IP4_NETMASK", str::parse::<Ipv4Addr>)?;
        let netmask_len = field(&vars, "INTERNAL_IP4_NETMASKLEN", str::parse::<u8>)?;
        let network_address = field(&vars, "INTERNAL_IP4_NETADDR", str::parse::<Ipv4Addr>)?;
        let dns_servers = field(&vars, "INTERNAL_IP4_DNS", parse_list::<Ipv4Addr>)?.unwrap_or_default();
        let nbns_servers =
            field(&vars, "INTERNAL_IP4_NBNS", parse_list::<Ipv4Addr>)?.unwrap_or_default();

        let network = match network_address {
            None => None,
            Some(address) => {
                let prefix_len = netmask_len
                    .ok_or_else(|| EnvError::MissingVar("INTERNAL_IP4_NETMASKLEN".into()))?;
                Some(reconstruct_network(
                    address,
                    prefix_len,
                    netmask,
                    "INTERNAL_IP4_NETMASKLEN",
                    "INTERNAL_IP4_NETMASK",
                )?)
            }
        };

        // The IPv6 subnet comes from the separate netmask when given,
        // otherwise from the prefix carried on the address itself.
        let interface6 = field(&vars, "INTERNAL_IP6_ADDRESS", parse_ipv6_interface)?;
        let netmask6 = field(&vars, "INTERNAL_IP6_NETMASK", parse_ipv6_netmask)?;
        let network6 = match interface6 {
            None => None,
            Some(interface) => {
                let prefix_len = netmask6.unwrap_or(interface.prefix_len());
                let network = Ipv6Net::new(interface.addr(), prefix_len).map_err(|e| {
                    EnvError::Invalid {
                        var: "INTERNAL_IP6_NETMASK".into(),
                        value: vars.get("INTERNAL_IP6_NETMASK").cloned().unwrap_or_default(),
                        source: e.into(),
                    }
                })?;
                Some(network.trunc())
            }
        };
        let dns6_servers =
            field(&vars, "INTERNAL_IP6_DNS", parse_list::<Ipv6Addr>)?.unwrap_or_default();

        let split_include_count = field(&vars, "CISCO_SPLIT_INC", str::parse::<usize>)?.unwrap_or(0);
        let split_exclude_count = field(&vars, "CISCO_SPLIT_EXC", str::parse::<usize>)?.unwrap_or(0);
        let split_include6_count =
            field(&vars, "CISCO_IPV6_SPLIT_INC", str::parse::<usize>)?.unwrap_or(0);
        let split_exclude6_count =
            field(&vars, "CISCO_IPV6_SPLIT_EXC", str::parse::<usize>)?.unwrap_or(0);

        let split_include = parse_splits(&vars, "INC", split_include_count)?;
        let split_exclude = parse_splits(&vars, "EXC", split_exclude_count)?;
        let ipv6_split_vars = vars.keys().any(|k| k.starts_with("CISCO_IPV6_SPLIT_"));

        Ok(Self {
            reason,
            gateway,
            tunnel_device,
            search_domains,
            banner,
            my_address,
            mtu,
            netmask,
            network,
            dns_servers,
            nbns_servers,
            my_address6: interface6.map(|i| i.addr()),
            network6,
            netmask6_set: netmask6.is_some(),
            dns6_servers,
            split_include,
            split_exclude,
            split_include6_count,
            split_exclude6_count,
            ipv6_split_vars,
        })
    }

    /// Things present in the environment that will not be fully honored
    pub fn warnings(&self) -> Vec<EnvWarning> {
        let mut warnings = Vec::new();
        if self.my_address6.is_some() || self.netmask6_set {
            warnings.push(EnvWarning::Ipv6AddressOrNetmask);
        }
        if !self.dns6_servers.is_empty() {
            warnings.push(EnvWarning::Ipv6DnsServers);
        }
        if self.ipv6_split_vars {
            warnings.push(EnvWarning::Ipv6SplitVariables);
        }
        warnings
    }

    /// Tunnel device name, or an empty string before the tunnel exists
    pub fn tundev(&self) -> &str {
        self.tunnel_device.as_deref().unwrap_or_default()
    }

    /// The VPN's own subnets, IPv4 first
    pub fn networks(&self) -> Vec<IpNet> {
        self.network
            .map(IpNet::V4)
            .into_iter()
            .chain(self.network6.map(IpNet::V6))
            .collect()
    }
}

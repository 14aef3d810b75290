//! What the user asked for: routes, hostnames, aliases and behavior flags
//!
//! Route parameters come from the command line and the config file:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `10.1.0.0/16`, `10.1.2.3` | Subnet (or single address) to route through the VPN |
//! | `git.corp.example` | Hostname to resolve with the VPN's DNS, route, and add to /etc/hosts |
//! | `git=gitlab=10.1.2.3` | Alias: names mapped to a fixed address, routed and added to /etc/hosts |

use crate::vpnc::env::SessionEnv;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteSpecError {
    #[error("Invalid alias address in {spec}: {address}")]
    InvalidAliasAddress { spec: String, address: String },
    #[error("Alias {0} has no hostname")]
    EmptyAlias(String),
}

/// One route parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSpec {
    Subnet(IpNet),
    Host(String),
    Alias { names: Vec<String>, address: IpAddr },
}

impl FromStr for RouteSpec {
    type Err = RouteSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((names, address)) = s.rsplit_once('=') {
            let address = address
                .parse()
                .map_err(|_| RouteSpecError::InvalidAliasAddress {
                    spec: s.to_string(),
                    address: address.to_string(),
                })?;
            let names: Vec<String> = names
                .split('=')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                return Err(RouteSpecError::EmptyAlias(s.to_string()));
            }
            return Ok(RouteSpec::Alias { names, address });
        }

        // Host bits are ignored, as are a bare address's missing prefix
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(RouteSpec::Subnet(net.trunc()));
        }
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(RouteSpec::Subnet(IpNet::from(addr)));
        }
        Ok(RouteSpec::Host(s.to_string()))
    }
}

/// Behavior flags and raw route parameters, before they are combined with
/// the session environment
#[derive(Debug, Clone)]
pub struct Options {
    pub routes: Vec<RouteSpec>,
    pub kill: Vec<PathBuf>,
    pub name: Option<String>,
    /// Search domains; `None` means use the VPN's `CISCO_DEF_DOMAIN`
    pub domains: Option<Vec<String>>,
    pub banner: bool,
    pub incoming: bool,
    pub route_internal: bool,
    pub route_splits: bool,
    pub host_names: bool,
    pub short_names: bool,
    pub ns_hosts: bool,
    pub nbns: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            kill: Vec::new(),
            name: None,
            domains: None,
            banner: false,
            incoming: false,
            route_internal: false,
            route_splits: false,
            host_names: true,
            short_names: true,
            ns_hosts: true,
            nbns: false,
        }
    }
}

/// The user's intent resolved against the session
#[derive(Debug, Clone)]
pub struct Intent {
    /// VPN name, used to tag hosts-file entries
    pub name: String,
    pub domains: Vec<String>,
    /// Subnets to route through the tunnel
    pub subnets: Vec<IpNet>,
    /// Subnets whose pre-connect routes must survive
    pub exc_subnets: Vec<IpNet>,
    /// Hostnames to look up after connecting
    pub hosts: Vec<String>,
    pub aliases: BTreeMap<IpAddr, Vec<String>>,
    pub kill: Vec<PathBuf>,
    pub banner: bool,
    pub incoming: bool,
    pub host_names: bool,
    pub short_names: bool,
    pub ns_hosts: bool,
    pub nbns: bool,
}

impl Intent {
    pub fn new(options: Options, env: &SessionEnv) -> Self {
        let mut subnets = Vec::new();
        let mut exc_subnets = Vec::new();
        let mut hosts = Vec::new();
        let mut aliases: BTreeMap<IpAddr, Vec<String>> = BTreeMap::new();

        for route in options.routes {
            match route {
                RouteSpec::Subnet(net) => subnets.push(net),
                RouteSpec::Host(host) => hosts.push(host),
                RouteSpec::Alias { names, address } => {
                    aliases.entry(address).or_default().extend(names)
                }
            }
        }

        if options.route_internal {
            subnets.extend(env.networks());
        }
        if options.route_splits {
            subnets.extend(env.split_include.iter().copied().map(IpNet::V4));
            exc_subnets.extend(env.split_exclude.iter().copied().map(IpNet::V4));
        }

        Self {
            name: options.name.unwrap_or_else(|| env.tundev().to_string()),
            domains: options.domains.unwrap_or_else(|| env.search_domains.clone()),
            subnets,
            exc_subnets,
            hosts,
            aliases,
            kill: options.kill,
            banner: options.banner,
            incoming: options.incoming,
            host_names: options.host_names,
            short_names: options.short_names,
            ns_hosts: options.ns_hosts,
            nbns: options.nbns,
        }
    }
}

/// Parse a list of route parameters, stopping at the first bad one
pub fn parse_routes<S: AsRef<str>>(specs: &[S]) -> Result<Vec<RouteSpec>, RouteSpecError> {
    specs.iter().map(|s| s.as_ref().parse()).collect()
}

//! Platform-specific implementations
//!
//! Every OS interaction the lifecycle handlers need is expressed as one of
//! the provider traits below. `get_providers` picks the implementations for
//! the host OS; tests substitute the in-memory set from `fake`.

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

pub mod generic;

#[cfg(test)]
pub mod fake;

use crate::vpn::hosts::HostsError;
use ipnet::IpNet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Hosts file error: {0}")]
    Hosts(#[from] HostsError),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Where traffic for a destination goes: next hop, device, source and MTU.
///
/// Returned by `RouteProvider::get_route` and accepted by the add/replace
/// calls, so a queried route can be re-installed as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub via: Option<IpAddr>,
    pub dev: Option<String>,
    pub src: Option<IpAddr>,
    pub mtu: Option<u32>,
}

impl RouteInfo {
    /// A route straight out of a device, with no next hop
    pub fn dev(device: impl Into<String>) -> Self {
        Self {
            dev: Some(device.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub state: Option<LinkState>,
    pub mtu: Option<u32>,
}

/// One hosts-file line: an address and the names that map to it
pub type HostEntry = (IpAddr, Vec<String>);

pub trait ProcessProvider {
    /// Path of the executable running as `pid`
    fn pid2exe(&self, pid: i32) -> Result<Option<PathBuf>, PlatformError>;
    /// Parent of `pid`, or of the current process when `None`
    fn ppid_of(&self, pid: Option<i32>) -> Result<Option<i32>, PlatformError>;
    fn kill(&self, pid: i32) -> Result<(), PlatformError>;
}

pub trait RouteProvider {
    /// Add a route; may fail if it already exists.
    fn add_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError>;
    /// Add or replace a route; must not fail just because it exists.
    fn replace_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError>;
    fn remove_route(&self, destination: &IpNet) -> Result<(), PlatformError>;
    /// The route the kernel currently uses to reach `destination`
    fn get_route(&self, destination: &IpNet) -> Result<RouteInfo, PlatformError>;
    fn flush_cache(&self) -> Result<(), PlatformError>;
    fn get_link_info(&self, device: &str) -> Result<LinkInfo, PlatformError>;
    fn set_link_info(
        &self,
        device: &str,
        state: LinkState,
        mtu: Option<u32>,
    ) -> Result<(), PlatformError>;
    fn add_address(&self, device: &str, address: IpAddr) -> Result<(), PlatformError>;
}

pub trait FirewallProvider {
    /// Drop unsolicited inbound traffic arriving on `device`
    fn configure_firewall(&self, device: &str) -> Result<(), PlatformError>;
    fn deconfigure_firewall(&self, device: &str) -> Result<(), PlatformError>;
}

pub trait DnsProvider {
    /// Look up `hostname` on the given nameservers only.
    ///
    /// `None` means the lookup came back empty or every server failed.
    fn lookup_host(
        &self,
        hostname: &str,
        dns_servers: &[IpAddr],
        search_domains: &[String],
        bind_address: Option<IpAddr>,
    ) -> Option<Vec<IpAddr>>;
}

pub trait HostsProvider {
    /// Replace the block tagged with `name` by `host_map`.
    ///
    /// Returns the number of entries written, or, when `host_map` is empty,
    /// the number of entries removed.
    fn write_hosts(&self, host_map: &[HostEntry], name: &str) -> Result<usize, PlatformError>;
}

/// OS support for creating tunnel devices. Nothing to do by default.
pub trait TunnelPrepProvider {
    fn create_tunnel(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn prepare_tunnel(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// The full set of providers a lifecycle handler works with
pub struct Providers {
    pub process: Box<dyn ProcessProvider>,
    pub route: Box<dyn RouteProvider>,
    pub firewall: Box<dyn FirewallProvider>,
    pub dns: Box<dyn DnsProvider>,
    pub hosts: Box<dyn HostsProvider>,
    pub prep: Box<dyn TunnelPrepProvider>,
}

/// Get the appropriate providers for the current platform
pub fn get_providers() -> Result<Providers, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Providers {
            process: Box::new(linux::ProcfsProvider::new()),
            route: Box::new(linux::Iproute2Provider::new()),
            firewall: Box::new(linux::IptablesProvider::new()),
            dns: Box::new(crate::vpn::dns::VpnDnsResolver::new()),
            hosts: Box::new(crate::vpn::hosts::HostsManager::new()),
            prep: Box::new(linux::CheckTunDevProvider::new()),
        })
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Providers {
            process: Box::new(mac::PsProvider::new()),
            route: Box::new(mac::BsdRouteProvider::new()),
            firewall: Box::new(generic::NoFirewallProvider),
            dns: Box::new(crate::vpn::dns::VpnDnsResolver::new()),
            hosts: Box::new(crate::vpn::hosts::HostsManager::new()),
            prep: Box::new(generic::NoTunnelPrepProvider),
        })
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Run an external command and return its stdout, mapping a non-zero exit
/// to `CommandFailed` with the command's stderr.
pub(crate) fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, PlatformError> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let command = format!("{} {}", program, args.join(" "));
    debug!("Running: {}", command);

    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| PlatformError::CommandFailed {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::CommandFailed {
            command,
            message: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

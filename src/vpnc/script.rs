//! vpnc-script lifecycle handlers
//!
//! This module implements the core logic for handling VPN client lifecycle
//! events. Each handler computes the routing, firewall and hosts-file changes
//! for its phase and applies them through the [`Providers`]:
//!
//! 1. pre-init: prepare the OS to create tunnel devices
//! 2. connect: pin the gateway route, block inbound traffic, bring up the
//!    tunnel, route nameservers/subnets/aliases through it, restore excluded
//!    subnets
//! 3. post-connect: resolve hostnames with the VPN's DNS, write /etc/hosts,
//!    route the resolved addresses
//! 4. disconnect: kill helper processes, undo hosts/gateway/firewall changes
//!
//! # Error Handling
//!
//! Only a broken environment aborts a phase. Individual provider failures are
//! logged as warnings and the rest of the phase carries on, so a route that
//! is already gone does not stop the remaining cleanup.

use crate::config::ConfigError;
use crate::platform::{HostEntry, LinkState, PlatformError, Providers, RouteInfo, RouteProvider};
use crate::vpnc::env::{EnvError, Reason, SessionEnv};
use crate::vpnc::intent::{Intent, RouteSpecError};
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Encapsulation overhead subtracted from the gateway interface's MTU
pub const MTU_OVERHEAD: u32 = 88;
/// Tunnel MTU when nothing better is known
pub const DEFAULT_MTU: u32 = 1412;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Environment parsing failed: {0}")]
    EnvError(#[from] EnvError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Invalid route parameter: {0}")]
    RouteError(#[from] RouteSpecError),
    #[error("Platform error: {0}")]
    PlatformError(#[from] PlatformError),
}

/// How the connect phase relates to the post-connect phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Run connect and post-connect back to back
    Full,
    /// Run connect only; post-connect is handed off to a background process
    Foreground,
    /// Run post-connect only, as the background half of a connect
    PostConnectOnly,
}

/// Main entry point for script mode
///
/// Dispatches to the handler for the lifecycle reason in `env`.
pub fn handle_script_mode(
    env: &SessionEnv,
    intent: &Intent,
    providers: &Providers,
    mode: ConnectMode,
) -> Result<(), ScriptError> {
    info!(
        "Script mode: reason={}, tunnel={}",
        env.reason,
        env.tundev()
    );

    match env.reason {
        Reason::PreInit => do_pre_init(providers),
        Reason::Disconnect => do_disconnect(env, intent, providers),
        Reason::Reconnect | Reason::AttemptReconnect => {
            // Routes through a vanished tunnel device go away with it
            info!("Ignoring reason={}", env.reason);
            Ok(())
        }
        Reason::Connect => match mode {
            ConnectMode::Full => {
                do_connect(env, intent, providers)?;
                do_post_connect(env, intent, providers)
            }
            ConnectMode::Foreground => do_connect(env, intent, providers),
            ConnectMode::PostConnectOnly => do_post_connect(env, intent, providers),
        },
    }
}

fn require_tundev(env: &SessionEnv) -> Result<&str, EnvError> {
    env.tunnel_device
        .as_deref()
        .ok_or_else(|| EnvError::MissingVar("TUNDEV".into()))
}

fn require_gateway(env: &SessionEnv) -> Result<IpAddr, EnvError> {
    env.gateway
        .ok_or_else(|| EnvError::MissingVar("VPNGATEWAY".into()))
}

/// Handle pre-init: make sure tunnel devices can be created
pub fn do_pre_init(providers: &Providers) -> Result<(), ScriptError> {
    if let Err(e) = providers.prep.create_tunnel() {
        warn!("Failed to create tunnel device support: {}", e);
    }
    if let Err(e) = providers.prep.prepare_tunnel() {
        warn!("Failed to prepare tunnel device support: {}", e);
    }
    Ok(())
}

/// Handle VPN connect event
pub fn do_connect(
    env: &SessionEnv,
    intent: &Intent,
    providers: &Providers,
) -> Result<(), ScriptError> {
    let tundev = require_tundev(env)?;
    let gateway = require_gateway(env)?;
    let gateway_net = IpNet::from(gateway);
    let route = providers.route.as_ref();

    info!("Connecting: tunnel={}, gateway={}", tundev, gateway);

    if intent.banner {
        if let Some(ref banner) = env.banner {
            println!("Connect Banner:");
            for line in banner.lines() {
                println!("| {}", line);
            }
        }
    }

    // Pin the gateway to its current next hop before the tunnel device
    // claims routes that could cover it
    let gateway_route = match route.get_route(&gateway_net) {
        Ok(current) => {
            if let Err(e) = route.replace_route(&gateway_net, &current) {
                warn!("Failed to set explicit route to VPN gateway {}: {}", gateway, e);
            }
            Some(current)
        }
        Err(e) => {
            warn!("Could not determine current route to VPN gateway {}: {}", gateway, e);
            None
        }
    };

    if !intent.incoming {
        match providers.firewall.configure_firewall(tundev) {
            Ok(()) => info!("Blocked incoming traffic from VPN interface {}", tundev),
            Err(e) => {
                if let Err(e) = providers.firewall.deconfigure_firewall(tundev) {
                    debug!("Rollback of partial firewall rules for {}: {}", tundev, e);
                }
                warn!("Failed to block incoming traffic on {}: {}", tundev, e);
            }
        }
    }

    let gateway_dev = gateway_route.as_ref().and_then(|r| r.dev.as_deref());
    let (mtu, guess) = tunnel_mtu(env.mtu, gateway_dev, route);
    if let Some(guess) = guess {
        warn!("{}", guess);
    }
    if let Err(e) = route.set_link_info(tundev, LinkState::Up, Some(mtu)) {
        warn!("Failed to bring up {} with MTU {}: {}", tundev, mtu, e);
    }

    let addresses = env
        .my_address
        .map(IpAddr::V4)
        .into_iter()
        .chain(env.my_address6.map(IpAddr::V6));
    for address in addresses {
        if let Err(e) = route.add_address(tundev, address) {
            warn!("Failed to add address {} to {}: {}", address, tundev, e);
        }
    }

    // Save routes for excluded subnets before anything can shadow them
    let exc_routes: Vec<(IpNet, Option<RouteInfo>)> = intent
        .exc_subnets
        .iter()
        .map(|dest| match route.get_route(dest) {
            Ok(current) => (*dest, Some(current)),
            Err(e) => {
                warn!("Could not save current route for excluded subnet {}: {}", dest, e);
                (*dest, None)
            }
        })
        .collect();

    let nameservers = nameservers(env, intent);
    let destinations = nameservers
        .iter()
        .map(|ip| IpNet::from(*ip))
        .chain(intent.subnets.iter().copied())
        .chain(intent.aliases.keys().map(|ip| IpNet::from(*ip)));
    install_tunnel_routes(route, destinations, tundev, gateway_net);
    flush_cache(route);
    info!(
        "Added routes for {} nameservers, {} subnets, {} aliases.",
        nameservers.len(),
        intent.subnets.len(),
        intent.aliases.len()
    );

    for (dest, saved) in &exc_routes {
        match saved {
            Some(saved) => {
                if let Err(e) = route.replace_route(dest, saved) {
                    warn!("Failed to restore route for excluded subnet {}: {}", dest, e);
                }
            }
            None => warn!("Not restoring route for excluded subnet {}: none was saved", dest),
        }
    }
    flush_cache(route);
    info!("Restored routes for {} excluded subnets.", exc_routes.len());

    Ok(())
}

/// Handle the second half of connect: hostname lookups and /etc/hosts
pub fn do_post_connect(
    env: &SessionEnv,
    intent: &Intent,
    providers: &Providers,
) -> Result<(), ScriptError> {
    let tundev = require_tundev(env)?;
    let gateway_net = IpNet::from(require_gateway(env)?);

    let mut ip_routes: BTreeSet<IpAddr> = BTreeSet::new();
    let mut host_map: Vec<HostEntry> = Vec::new();

    if intent.ns_hosts {
        let ns_names = nameserver_names(env, intent);
        info!("Adding /etc/hosts entries for {} nameservers...", ns_names.len());
        for (ip, names) in &ns_names {
            debug!("  {} = {}", ip, names.join(", "));
        }
        host_map.extend(ns_names);
    }

    let dns_servers: Vec<IpAddr> = env.dns_servers.iter().copied().map(IpAddr::V4).collect();
    let bind_address = env.my_address.map(IpAddr::V4);

    info!("Looking up {} hosts using VPN DNS servers...", intent.hosts.len());
    for host in &intent.hosts {
        let ips = providers
            .dns
            .lookup_host(host, &dns_servers, &intent.domains, bind_address)
            .filter(|ips| !ips.is_empty());

        let Some(ips) = ips else {
            warn!("Lookup for {} on VPN DNS servers failed.", host);
            continue;
        };

        info!("  {} = {}", host, join(&ips));
        ip_routes.extend(ips.iter().copied());
        if intent.host_names {
            let names = names_for(host, &intent.domains, intent.short_names, true);
            if !names.is_empty() {
                host_map.extend(ips.iter().map(|ip| (*ip, names.clone())));
            }
        }
    }

    for (ip, names) in &intent.aliases {
        host_map.push((*ip, names.clone()));
    }

    if !host_map.is_empty() {
        match providers.hosts.write_hosts(&host_map, &intent.name) {
            Ok(written) => info!(
                "Added hostnames and aliases for {} addresses to /etc/hosts.",
                written
            ),
            Err(e) => warn!("Failed to update /etc/hosts: {}", e),
        }
    }

    let route = providers.route.as_ref();
    let added = install_tunnel_routes(
        route,
        ip_routes.iter().map(|ip| IpNet::from(*ip)),
        tundev,
        gateway_net,
    );
    flush_cache(route);
    info!("Added {} routes for named hosts.", added);

    Ok(())
}

/// Handle VPN disconnect event
pub fn do_disconnect(
    env: &SessionEnv,
    intent: &Intent,
    providers: &Providers,
) -> Result<(), ScriptError> {
    let tundev = require_tundev(env)?;
    let gateway = require_gateway(env)?;

    info!("Disconnecting: tunnel={}", tundev);

    for pidfile in &intent.kill {
        kill_from_pidfile(providers, pidfile);
    }

    match providers.hosts.write_hosts(&[], &intent.name) {
        Ok(removed) => info!("Removed {} hosts from /etc/hosts", removed),
        Err(e) => warn!("Failed to clean /etc/hosts: {}", e),
    }

    if let Err(e) = providers.route.remove_route(&IpNet::from(gateway)) {
        warn!("Could not delete route to VPN gateway ({}): {}", gateway, e);
    }

    if !intent.incoming {
        if let Err(e) = providers.firewall.deconfigure_firewall(tundev) {
            warn!(
                "Failed to remove firewall rules for VPN interface ({}): {}",
                tundev, e
            );
        }
    }

    Ok(())
}

/// Names for a host in /etc/hosts.
///
/// A dotted name is its own long form, and its first label is the short
/// form when the rest is one of the search domains. A dotless name is
/// qualified with the first search domain for its long form, and is only
/// used bare when no long form comes out.
pub fn names_for(host: &str, domains: &[String], short: bool, long: bool) -> Vec<String> {
    let mut names = Vec::new();

    match host.split_once('.') {
        Some((first, rest)) => {
            if long {
                names.push(host.to_string());
            }
            if short && domains.iter().any(|d| d == rest) {
                names.push(first.to_string());
            }
        }
        None => {
            if long {
                if let Some(domain) = domains.first() {
                    names.push(format!("{}.{}", host, domain));
                }
            }
            if short && names.is_empty() {
                names.push(host.to_string());
            }
        }
    }

    names
}

/// Pick the tunnel MTU, returning the warning to log when it is a guess
fn tunnel_mtu(
    explicit: Option<u32>,
    gateway_dev: Option<&str>,
    route: &dyn RouteProvider,
) -> (u32, Option<String>) {
    if let Some(mtu) = explicit {
        return (mtu, None);
    }

    let dev_mtu = gateway_dev.and_then(|dev| match route.get_link_info(dev) {
        Ok(info) => info.mtu,
        Err(e) => {
            debug!("Could not get link info for {}: {}", dev, e);
            None
        }
    });

    match (gateway_dev, dev_mtu) {
        (Some(dev), Some(dev_mtu)) if dev_mtu > MTU_OVERHEAD => {
            let mtu = dev_mtu - MTU_OVERHEAD;
            let guess = format!(
                "Guessing MTU is {} (the MTU of {} - {})",
                mtu, dev, MTU_OVERHEAD
            );
            (mtu, Some(guess))
        }
        _ => {
            let guess = format!(
                "Guessing default MTU of {} (couldn't determine MTU of {})",
                DEFAULT_MTU,
                gateway_dev.unwrap_or("the gateway interface")
            );
            (DEFAULT_MTU, Some(guess))
        }
    }
}

fn nameservers(env: &SessionEnv, intent: &Intent) -> Vec<IpAddr> {
    let nbns: &[_] = if intent.nbns { &env.nbns_servers } else { &[] };
    env.dns_servers
        .iter()
        .chain(nbns)
        .copied()
        .map(IpAddr::V4)
        .collect()
}

/// `dnsN.NAME` (and `nbnsN.NAME`) entries for the VPN's nameservers
fn nameserver_names(env: &SessionEnv, intent: &Intent) -> Vec<HostEntry> {
    let named = |prefix: &str, servers: &[std::net::Ipv4Addr]| -> Vec<HostEntry> {
        servers
            .iter()
            .enumerate()
            .map(|(i, ip)| (IpAddr::V4(*ip), vec![format!("{}{}.{}", prefix, i, intent.name)]))
            .collect()
    };

    let mut entries = named("dns", &env.dns_servers);
    if intent.nbns {
        entries.extend(named("nbns", &env.nbns_servers));
    }
    entries
}

/// Route each destination through the tunnel device, returning how many
/// routes went in. The gateway's own host route is never redirected.
fn install_tunnel_routes(
    route: &dyn RouteProvider,
    destinations: impl IntoIterator<Item = IpNet>,
    tundev: &str,
    gateway_net: IpNet,
) -> usize {
    let via_tunnel = RouteInfo::dev(tundev);
    let mut added = 0;

    for dest in destinations {
        if dest == gateway_net {
            warn!("Not routing VPN gateway {} through the VPN itself", dest.addr());
            continue;
        }
        match route.replace_route(&dest, &via_tunnel) {
            Ok(()) => added += 1,
            Err(e) => warn!("Failed to add route for {} via {}: {}", dest, tundev, e),
        }
    }

    added
}

fn flush_cache(route: &dyn RouteProvider) {
    if let Err(e) = route.flush_cache() {
        warn!("Failed to flush route cache: {}", e);
    }
}

fn kill_from_pidfile(providers: &Providers, pidfile: &Path) {
    let pid = fs::read_to_string(pidfile)
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0);

    let Some(pid) = pid else {
        warn!("Could not read pid from {}", pidfile.display());
        return;
    };

    match providers.process.kill(pid) {
        Ok(()) => info!("Killed pid {} from {}", pid, pidfile.display()),
        Err(e) => warn!(
            "Could not kill pid {} from {}: {}",
            pid,
            pidfile.display(),
            e
        ),
    }
}

fn join(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

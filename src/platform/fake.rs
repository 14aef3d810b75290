//! In-memory providers for exercising the lifecycle handlers in tests
//!
//! One `FakeSystem` backs every capability, so a test can set up a routing
//! table, run a phase, and then inspect the table, hosts blocks, firewall
//! state and the call log.

use super::{
    DnsProvider, FirewallProvider, HostEntry, HostsProvider, LinkInfo, LinkState, PlatformError,
    ProcessProvider, Providers, RouteInfo, RouteProvider, TunnelPrepProvider,
};
use ipnet::IpNet;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Default)]
struct State {
    routes: BTreeMap<IpNet, RouteInfo>,
    links: HashMap<String, LinkInfo>,
    addresses: Vec<(String, IpAddr)>,
    blocked: BTreeSet<String>,
    hosts: BTreeMap<String, Vec<HostEntry>>,
    dns: HashMap<String, Vec<IpAddr>>,
    lookups: Vec<(String, Option<IpAddr>)>,
    exes: HashMap<i32, PathBuf>,
    parents: HashMap<i32, i32>,
    killed: Vec<i32>,
    failing: HashSet<&'static str>,
    calls: Vec<String>,
    tunnel_created: bool,
    tunnel_prepared: bool,
}

#[derive(Clone, Default)]
pub struct FakeSystem(Rc<RefCell<State>>);

fn failure(op: &str, detail: impl std::fmt::Display) -> PlatformError {
    PlatformError::CommandFailed {
        command: format!("{} {}", op, detail),
        message: "simulated failure".to_string(),
    }
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn providers(&self) -> Providers {
        Providers {
            process: Box::new(self.clone()),
            route: Box::new(self.clone()),
            firewall: Box::new(self.clone()),
            dns: Box::new(self.clone()),
            hosts: Box::new(self.clone()),
            prep: Box::new(self.clone()),
        }
    }

    pub fn with_route(self, dest: &str, route: RouteInfo) -> Self {
        self.0.borrow_mut().routes.insert(dest.parse().unwrap(), route);
        self
    }

    pub fn with_link(self, dev: &str, mtu: u32) -> Self {
        self.0.borrow_mut().links.insert(
            dev.to_string(),
            LinkInfo {
                state: Some(LinkState::Up),
                mtu: Some(mtu),
            },
        );
        self
    }

    pub fn with_dns(self, name: &str, ips: &[&str]) -> Self {
        let ips: Vec<IpAddr> = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        self.0.borrow_mut().dns.insert(name.to_string(), ips);
        self
    }

    pub fn with_hosts_block(self, name: &str, entries: Vec<HostEntry>) -> Self {
        self.0.borrow_mut().hosts.insert(name.to_string(), entries);
        self
    }

    pub fn with_process(self, pid: i32, ppid: i32, exe: &str) -> Self {
        {
            let mut state = self.0.borrow_mut();
            state.exes.insert(pid, PathBuf::from(exe));
            state.parents.insert(pid, ppid);
        }
        self
    }

    /// Make every call to the named operation fail
    pub fn failing(self, op: &'static str) -> Self {
        self.0.borrow_mut().failing.insert(op);
        self
    }

    /// Route the kernel would pick for `addr` (longest prefix match)
    pub fn lookup(&self, addr: &str) -> Option<RouteInfo> {
        let addr: IpAddr = addr.parse().unwrap();
        self.route_for(addr)
    }

    pub fn route(&self, dest: &str) -> Option<RouteInfo> {
        let dest: IpNet = dest.parse().unwrap();
        self.0.borrow().routes.get(&dest).cloned()
    }

    pub fn link(&self, dev: &str) -> Option<LinkInfo> {
        self.0.borrow().links.get(dev).cloned()
    }

    pub fn addresses(&self) -> Vec<(String, IpAddr)> {
        self.0.borrow().addresses.clone()
    }

    pub fn is_blocked(&self, dev: &str) -> bool {
        self.0.borrow().blocked.contains(dev)
    }

    pub fn hosts_block(&self, name: &str) -> Option<Vec<HostEntry>> {
        self.0.borrow().hosts.get(name).cloned()
    }

    pub fn lookups(&self) -> Vec<(String, Option<IpAddr>)> {
        self.0.borrow().lookups.clone()
    }

    pub fn killed(&self) -> Vec<i32> {
        self.0.borrow().killed.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    pub fn tunnel_ready(&self) -> bool {
        let state = self.0.borrow();
        state.tunnel_created && state.tunnel_prepared
    }

    /// Log the call, then fail if the operation is marked as failing
    fn call(&self, op: &'static str, detail: impl std::fmt::Display) -> Result<(), PlatformError> {
        let mut state = self.0.borrow_mut();
        state.calls.push(format!("{} {}", op, detail));
        if state.failing.contains(op) {
            return Err(failure(op, detail));
        }
        Ok(())
    }

    fn route_for(&self, addr: IpAddr) -> Option<RouteInfo> {
        self.0
            .borrow()
            .routes
            .iter()
            .filter(|(net, _)| net.contains(&addr))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, route)| route.clone())
    }
}

impl ProcessProvider for FakeSystem {
    fn pid2exe(&self, pid: i32) -> Result<Option<PathBuf>, PlatformError> {
        Ok(self.0.borrow().exes.get(&pid).cloned())
    }

    fn ppid_of(&self, pid: Option<i32>) -> Result<Option<i32>, PlatformError> {
        // The current process is pid 0 here
        Ok(self.0.borrow().parents.get(&pid.unwrap_or(0)).copied())
    }

    fn kill(&self, pid: i32) -> Result<(), PlatformError> {
        self.call("kill", pid)?;
        self.0.borrow_mut().killed.push(pid);
        Ok(())
    }
}

impl RouteProvider for FakeSystem {
    fn add_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError> {
        self.call("add_route", destination)?;
        let mut state = self.0.borrow_mut();
        if state.routes.contains_key(destination) {
            return Err(failure("add_route", destination));
        }
        state.routes.insert(*destination, route.clone());
        Ok(())
    }

    fn replace_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError> {
        self.call("replace_route", destination)?;
        self.0.borrow_mut().routes.insert(*destination, route.clone());
        Ok(())
    }

    fn remove_route(&self, destination: &IpNet) -> Result<(), PlatformError> {
        self.call("remove_route", destination)?;
        match self.0.borrow_mut().routes.remove(destination) {
            Some(_) => Ok(()),
            None => Err(failure("remove_route", destination)),
        }
    }

    fn get_route(&self, destination: &IpNet) -> Result<RouteInfo, PlatformError> {
        self.call("get_route", destination)?;
        let mut route = self
            .route_for(destination.addr())
            .ok_or_else(|| failure("get_route", destination))?;
        if route.mtu.is_none() {
            route.mtu = route
                .dev
                .as_ref()
                .and_then(|dev| self.link(dev))
                .and_then(|link| link.mtu);
        }
        Ok(route)
    }

    fn flush_cache(&self) -> Result<(), PlatformError> {
        self.call("flush_cache", "")
    }

    fn get_link_info(&self, device: &str) -> Result<LinkInfo, PlatformError> {
        self.call("get_link_info", device)?;
        self.link(device).ok_or_else(|| failure("get_link_info", device))
    }

    fn set_link_info(
        &self,
        device: &str,
        state: LinkState,
        mtu: Option<u32>,
    ) -> Result<(), PlatformError> {
        self.call("set_link_info", device)?;
        self.0.borrow_mut().links.insert(
            device.to_string(),
            LinkInfo {
                state: Some(state),
                mtu,
            },
        );
        Ok(())
    }

    fn add_address(&self, device: &str, address: IpAddr) -> Result<(), PlatformError> {
        self.call("add_address", device)?;
        self.0
            .borrow_mut()
            .addresses
            .push((device.to_string(), address));
        Ok(())
    }
}

impl FirewallProvider for FakeSystem {
    fn configure_firewall(&self, device: &str) -> Result<(), PlatformError> {
        // A failing configure leaves a half-applied rule behind
        self.0.borrow_mut().blocked.insert(device.to_string());
        self.call("configure_firewall", device)
    }

    fn deconfigure_firewall(&self, device: &str) -> Result<(), PlatformError> {
        self.call("deconfigure_firewall", device)?;
        if !self.0.borrow_mut().blocked.remove(device) {
            return Err(failure("deconfigure_firewall", device));
        }
        Ok(())
    }
}

impl DnsProvider for FakeSystem {
    fn lookup_host(
        &self,
        hostname: &str,
        dns_servers: &[IpAddr],
        _search_domains: &[String],
        bind_address: Option<IpAddr>,
    ) -> Option<Vec<IpAddr>> {
        let mut state = self.0.borrow_mut();
        state.calls.push(format!("lookup_host {}", hostname));
        state.lookups.push((hostname.to_string(), bind_address));
        if dns_servers.is_empty() {
            return None;
        }
        state.dns.get(hostname).cloned()
    }
}

impl HostsProvider for FakeSystem {
    fn write_hosts(&self, host_map: &[HostEntry], name: &str) -> Result<usize, PlatformError> {
        self.call("write_hosts", name)?;
        let mut state = self.0.borrow_mut();
        let previous = state.hosts.remove(name).map_or(0, |entries| entries.len());
        if host_map.is_empty() {
            return Ok(previous);
        }
        state.hosts.insert(name.to_string(), host_map.to_vec());
        Ok(host_map.len())
    }
}

impl TunnelPrepProvider for FakeSystem {
    fn create_tunnel(&self) -> Result<(), PlatformError> {
        self.call("create_tunnel", "")?;
        self.0.borrow_mut().tunnel_created = true;
        Ok(())
    }

    fn prepare_tunnel(&self) -> Result<(), PlatformError> {
        self.call("prepare_tunnel", "")?;
        self.0.borrow_mut().tunnel_prepared = true;
        Ok(())
    }
}

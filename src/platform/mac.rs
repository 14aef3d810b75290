//! macOS-specific providers: ps/lsof and BSD route/ifconfig

use super::{
    run, LinkInfo, LinkState, PlatformError, ProcessProvider, RouteInfo, RouteProvider,
};
use ipnet::IpNet;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

pub struct PsProvider;

impl PsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProvider for PsProvider {
    fn pid2exe(&self, pid: i32) -> Result<Option<PathBuf>, PlatformError> {
        let output = run("/usr/sbin/lsof", &["-p".to_string(), pid.to_string()])?;
        Ok(parse_lsof_txt(&output))
    }

    fn ppid_of(&self, pid: Option<i32>) -> Result<Option<i32>, PlatformError> {
        let Some(pid) = pid else {
            return Ok(Some(getppid().as_raw()));
        };
        let output = run(
            "/bin/ps",
            &["-p".to_string(), pid.to_string(), "-o".to_string(), "ppid=".to_string()],
        )?;
        Ok(output.trim().parse().ok())
    }

    fn kill(&self, pid: i32) -> Result<(), PlatformError> {
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)?;
        Ok(())
    }
}

/// The executable is the `txt` entry whose path is in the ninth column
fn parse_lsof_txt(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.get(3) {
            Some(&"txt") => parts.get(8).map(PathBuf::from),
            _ => None,
        }
    })
}

pub struct BsdRouteProvider;

impl BsdRouteProvider {
    pub fn new() -> Self {
        Self
    }

    fn route(&self, args: &[String]) -> Result<String, PlatformError> {
        let mut full = vec!["-n".to_string()];
        full.extend_from_slice(args);
        run("/sbin/route", &full)
    }

    fn ifconfig(&self, args: &[String]) -> Result<String, PlatformError> {
        run("/sbin/ifconfig", args)
    }
}

impl Default for BsdRouteProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteProvider for BsdRouteProvider {
    fn add_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError> {
        let mut args = vec!["add".to_string()];
        if let Some(mtu) = route.mtu {
            args.extend(["-mtu".to_string(), mtu.to_string()]);
        }
        if let Some(via) = route.via {
            args.extend([destination.to_string(), via.to_string()]);
        } else if let Some(ref dev) = route.dev {
            args.extend(["-interface".to_string(), destination.to_string(), dev.clone()]);
        }
        self.route(&args)?;
        Ok(())
    }

    // BSD route has no replace; `add` over an existing route is tolerated
    fn replace_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError> {
        self.add_route(destination, route)
    }

    fn remove_route(&self, destination: &IpNet) -> Result<(), PlatformError> {
        self.route(&["delete".to_string(), destination.to_string()])?;
        Ok(())
    }

    fn get_route(&self, destination: &IpNet) -> Result<RouteInfo, PlatformError> {
        let output = self.route(&["get".to_string(), destination.addr().to_string()])?;
        Ok(parse_route_get(&output))
    }

    fn flush_cache(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn get_link_info(&self, device: &str) -> Result<LinkInfo, PlatformError> {
        let output = self.ifconfig(&[device.to_string()])?;
        parse_ifconfig(&output).ok_or_else(|| PlatformError::UnexpectedOutput {
            command: format!("ifconfig {}", device),
            output: output.lines().next().unwrap_or_default().to_string(),
        })
    }

    fn set_link_info(
        &self,
        device: &str,
        state: LinkState,
        mtu: Option<u32>,
    ) -> Result<(), PlatformError> {
        let mut args = vec![device.to_string(), state.as_str().to_string()];
        if let Some(mtu) = mtu {
            args.extend(["mtu".to_string(), mtu.to_string()]);
        }
        self.ifconfig(&args)?;
        Ok(())
    }

    fn add_address(&self, device: &str, address: IpAddr) -> Result<(), PlatformError> {
        let family = if address.is_ipv6() { "inet6" } else { "inet" };
        self.ifconfig(&[
            device.to_string(),
            family.to_string(),
            IpNet::from(address).to_string(),
            address.to_string(),
        ])?;
        Ok(())
    }
}

/// Parse `route -n get` output: `key: value` lines, then a header row and a
/// value row holding the metrics (including `mtu`).
fn parse_route_get(output: &str) -> RouteInfo {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut lines = output.lines();

    while let Some(line) = lines.next() {
        match line.split_once(':') {
            Some((key, value)) => {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                let keys = line.split_whitespace();
                let values = lines.next().unwrap_or_default().split_whitespace();
                for (key, value) in keys.zip(values) {
                    fields.insert(key.to_string(), value.to_string());
                }
                break;
            }
        }
    }

    RouteInfo {
        via: fields.get("gateway").and_then(|v| v.parse().ok()),
        dev: fields.get("interface").cloned(),
        src: None,
        mtu: fields.get("mtu").and_then(|v| v.parse().ok()),
    }
}

/// Parse the first line of `ifconfig DEV`, e.g.
/// `en0: flags=8863<UP,BROADCAST,SMART,RUNNING,SIMPLEX,MULTICAST> mtu 1500`
fn parse_ifconfig(output: &str) -> Option<LinkInfo> {
    let line = output.lines().next()?;
    let (_, rest) = line.split_once("flags=")?;
    let flags = rest.split_once('<')?.1.split_once('>')?.0;
    let (_, mtu) = rest.rsplit_once("mtu ")?;

    let state = if flags.split(',').any(|f| f == "UP") {
        LinkState::Up
    } else {
        LinkState::Down
    };

    Some(LinkInfo {
        state: Some(state),
        mtu: mtu.trim().parse().ok(),
    })
}

//! Linux-specific providers: procfs, iproute2, iptables and /dev/net/tun

use super::{
    run, FirewallProvider, LinkInfo, LinkState, PlatformError, ProcessProvider, RouteInfo,
    RouteProvider, TunnelPrepProvider,
};
use ipnet::IpNet;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{access, getppid, AccessFlags, Pid};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TUN_NODE: &str = "/dev/net/tun";

pub struct ProcfsProvider;

impl ProcfsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProvider for ProcfsProvider {
    fn pid2exe(&self, pid: i32) -> Result<Option<PathBuf>, PlatformError> {
        match fs::read_link(format!("/proc/{}/exe", pid)) {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn ppid_of(&self, pid: Option<i32>) -> Result<Option<i32>, PlatformError> {
        let Some(pid) = pid else {
            return Ok(Some(getppid().as_raw()));
        };
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
        Ok(parse_stat_ppid(&stat))
    }

    fn kill(&self, pid: i32) -> Result<(), PlatformError> {
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)?;
        Ok(())
    }
}

/// Parent PID from the contents of /proc/PID/stat.
///
/// The command name may itself contain spaces and parentheses, so fields
/// are counted from the last closing parenthesis.
fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

pub struct Iproute2Provider;

impl Iproute2Provider {
    pub fn new() -> Self {
        Self
    }

    fn ip(&self, args: &[String]) -> Result<String, PlatformError> {
        run("ip", args)
    }

    fn route_command(
        &self,
        verb: &str,
        destination: &IpNet,
        route: &RouteInfo,
    ) -> Result<(), PlatformError> {
        let mut args = vec!["route".to_string(), verb.to_string(), destination.to_string()];
        if let Some(via) = route.via {
            args.extend(["via".to_string(), via.to_string()]);
        }
        if let Some(ref dev) = route.dev {
            args.extend(["dev".to_string(), dev.clone()]);
        }
        if let Some(src) = route.src {
            args.extend(["src".to_string(), src.to_string()]);
        }
        if let Some(mtu) = route.mtu {
            args.extend(["mtu".to_string(), mtu.to_string()]);
        }
        self.ip(&args)?;
        Ok(())
    }
}

impl Default for Iproute2Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteProvider for Iproute2Provider {
    fn add_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError> {
        self.route_command("add", destination, route)
    }

    fn replace_route(&self, destination: &IpNet, route: &RouteInfo) -> Result<(), PlatformError> {
        self.route_command("replace", destination, route)
    }

    fn remove_route(&self, destination: &IpNet) -> Result<(), PlatformError> {
        self.ip(&["route".into(), "del".into(), destination.to_string()])?;
        Ok(())
    }

    fn get_route(&self, destination: &IpNet) -> Result<RouteInfo, PlatformError> {
        let output = self.ip(&["route".into(), "get".into(), destination.addr().to_string()])?;
        Ok(parse_route_get(&output))
    }

    fn flush_cache(&self) -> Result<(), PlatformError> {
        self.ip(&["route".into(), "flush".into(), "cache".into()])?;
        Ok(())
    }

    fn get_link_info(&self, device: &str) -> Result<LinkInfo, PlatformError> {
        let output = self.ip(&["link".into(), "show".into(), "dev".into(), device.into()])?;
        Ok(parse_link_show(&output))
    }

    fn set_link_info(
        &self,
        device: &str,
        state: LinkState,
        mtu: Option<u32>,
    ) -> Result<(), PlatformError> {
        let mut args = vec![
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            device.to_string(),
            state.as_str().to_string(),
        ];
        if let Some(mtu) = mtu {
            args.extend(["mtu".to_string(), mtu.to_string()]);
        }
        self.ip(&args)?;
        Ok(())
    }

    fn add_address(&self, device: &str, address: IpAddr) -> Result<(), PlatformError> {
        self.ip(&[
            "address".into(),
            "add".into(),
            address.to_string(),
            "dev".into(),
            device.into(),
        ])?;
        Ok(())
    }
}

/// Parse `ip route get` output, e.g.
/// `8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.5 uid 0 \n cache mtu 1400`
fn parse_route_get(output: &str) -> RouteInfo {
    let mut route = RouteInfo::default();
    let mut tokens = output.split_whitespace();

    while let Some(token) = tokens.next() {
        match token {
            "via" => {
                let mut value = tokens.next();
                // `via inet6 fe80::1` when the next hop is of another family
                if matches!(value, Some("inet") | Some("inet6")) {
                    value = tokens.next();
                }
                route.via = value.and_then(|v| v.parse().ok());
            }
            "dev" => route.dev = tokens.next().map(str::to_string),
            "src" => route.src = tokens.next().and_then(|v| v.parse().ok()),
            "mtu" => {
                let mut value = tokens.next();
                if value == Some("lock") {
                    value = tokens.next();
                }
                route.mtu = value.and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }

    route
}

/// Parse `ip link show dev DEV` output, e.g.
/// `2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP ...`
fn parse_link_show(output: &str) -> LinkInfo {
    let mut info = LinkInfo::default();
    let mut flags_up = false;
    let mut tokens = output.split_whitespace();

    while let Some(token) = tokens.next() {
        if token.starts_with('<') && token.ends_with('>') {
            flags_up = token
                .trim_matches(|c| c == '<' || c == '>')
                .split(',')
                .any(|flag| flag == "UP");
            continue;
        }
        match token {
            "mtu" => info.mtu = tokens.next().and_then(|v| v.parse().ok()),
            "state" => {
                info.state = match tokens.next() {
                    Some("UP") => Some(LinkState::Up),
                    Some("DOWN") => Some(LinkState::Down),
                    _ => None,
                }
            }
            _ => {}
        }
    }

    // tun devices report `state UNKNOWN`; fall back to the interface flags
    if info.state.is_none() {
        info.state = Some(if flags_up { LinkState::Up } else { LinkState::Down });
    }

    info
}

pub struct IptablesProvider;

impl IptablesProvider {
    pub fn new() -> Self {
        Self
    }

    fn rules(device: &str) -> [Vec<String>; 2] {
        let base = |rest: &[&str]| {
            let mut rule = vec!["INPUT".to_string(), "-i".to_string(), device.to_string()];
            rule.extend(rest.iter().map(|s| s.to_string()));
            rule
        };
        [
            base(&["-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"]),
            base(&["-j", "DROP"]),
        ]
    }

    fn iptables(&self, action: &str, rule: &[String]) -> Result<(), PlatformError> {
        let mut args = vec![action.to_string()];
        args.extend_from_slice(rule);
        run("iptables", &args)?;
        Ok(())
    }
}

impl Default for IptablesProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallProvider for IptablesProvider {
    fn configure_firewall(&self, device: &str) -> Result<(), PlatformError> {
        for rule in Self::rules(device) {
            self.iptables("-A", &rule)?;
        }
        Ok(())
    }

    fn deconfigure_firewall(&self, device: &str) -> Result<(), PlatformError> {
        // Remove every rule even if an earlier one is already gone
        let mut first_error = None;
        for rule in Self::rules(device) {
            if let Err(e) = self.iptables("-D", &rule) {
                debug!("Could not delete iptables rule for {}: {}", device, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

pub struct CheckTunDevProvider {
    node: PathBuf,
}

impl CheckTunDevProvider {
    pub fn new() -> Self {
        Self {
            node: PathBuf::from(TUN_NODE),
        }
    }
}

impl Default for CheckTunDevProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelPrepProvider for CheckTunDevProvider {
    fn create_tunnel(&self) -> Result<(), PlatformError> {
        if self.node.exists() {
            return Ok(());
        }
        if let Some(parent) = self.node.parent() {
            fs::create_dir_all(parent)?;
        }
        mknod(
            self.node.as_path(),
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o640),
            makedev(10, 200),
        )
        .map_err(std::io::Error::from)?;
        info!("Created tunnel device node {}", self.node.display());
        Ok(())
    }

    fn prepare_tunnel(&self) -> Result<(), PlatformError> {
        check_read_write(&self.node)
    }
}

fn check_read_write(path: &Path) -> Result<(), PlatformError> {
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).map_err(|e| {
        PlatformError::Io(std::io::Error::new(
            std::io::Error::from(e).kind(),
            format!("can't read and write {}", path.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_get_via() {
        let out = "8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.5 uid 1000 \n    cache \n";
        let route = parse_route_get(out);
        assert_eq!(route.via, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(route.dev.as_deref(), Some("eth0"));
        assert_eq!(route.src, Some("192.168.1.5".parse().unwrap()));
        assert_eq!(route.mtu, None);
    }

    #[test]
    fn test_parse_route_get_direct_with_mtu() {
        let out = "10.0.0.5 dev tun0 src 10.0.0.2 uid 0 \n    cache mtu lock 1400\n";
        let route = parse_route_get(out);
        assert_eq!(route.via, None);
        assert_eq!(route.dev.as_deref(), Some("tun0"));
        assert_eq!(route.mtu, Some(1400));
    }

    #[test]
    fn test_parse_route_get_via_other_family() {
        let out = "10.1.1.1 via inet6 fe80::1 dev eth0 src 10.0.0.9 uid 0";
        let route = parse_route_get(out);
        assert_eq!(route.via, Some("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_link_show() {
        let out = "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel \
                   state UP mode DEFAULT group default qlen 1000\n    link/ether 00:11:22:33:44:55";
        let info = parse_link_show(out);
        assert_eq!(info.mtu, Some(1500));
        assert_eq!(info.state, Some(LinkState::Up));
    }

    #[test]
    fn test_parse_link_show_unknown_state_uses_flags() {
        let out = "7: tun0: <POINTOPOINT,MULTICAST,NOARP,UP,LOWER_UP> mtu 1412 qdisc fq_codel \
                   state UNKNOWN mode DEFAULT group default qlen 500";
        let info = parse_link_show(out);
        assert_eq!(info.mtu, Some(1412));
        assert_eq!(info.state, Some(LinkState::Up));

        let out = "7: tun0: <POINTOPOINT,MULTICAST,NOARP> mtu 1500 state UNKNOWN";
        assert_eq!(parse_link_show(out).state, Some(LinkState::Down));
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("1234 (bash) S 1200 1234 1234 0 -1"), Some(1200));
        assert_eq!(
            parse_stat_ppid("99 (weird (name) x) R 42 99 99 0 -1"),
            Some(42)
        );
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_iptables_rules() {
        let [accept, drop_rule] = IptablesProvider::rules("tun0");
        assert_eq!(accept[..3], ["INPUT", "-i", "tun0"]);
        assert!(accept.iter().any(|a| a == "RELATED,ESTABLISHED"));
        assert_eq!(drop_rule, ["INPUT", "-i", "tun0", "-j", "DROP"]);
    }

    #[test]
    fn test_ppid_of_current_process() {
        let provider = ProcfsProvider::new();
        let ppid = provider.ppid_of(None).unwrap();
        assert!(ppid.is_some());
    }

    #[test]
    fn test_pid2exe_self() {
        let provider = ProcfsProvider::new();
        let exe = provider.pid2exe(std::process::id() as i32).unwrap();
        assert!(exe.is_some());
    }

    #[test]
    fn test_check_read_write_missing_path() {
        let result = check_read_write(Path::new("/nonexistent/vpn-slice/tun"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("can't read and write"));
    }
}

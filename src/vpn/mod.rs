//! Name resolution and /etc/hosts management for VPN hostnames

pub mod dns;
pub mod hosts;

pub use dns::VpnDnsResolver;
pub use hosts::HostsManager;

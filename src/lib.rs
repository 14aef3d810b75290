//! vpn-slice - split-tunnel vpnc-script replacement
//!
//! Instead of routing everything through the VPN, only the subnets and hosts
//! named on the command line go through the tunnel. Hostnames are resolved
//! with the VPN's own DNS servers and added to /etc/hosts.
//!
//! # Architecture
//!
//! - `config`: Optional defaults file (TOML)
//! - `platform`: Provider traits and per-OS implementations (Linux, macOS)
//! - `vpn`: DNS lookups and hosts file management
//! - `vpnc`: vpnc-script environment, user intent and lifecycle handlers
//!
//! # Usage
//!
//! As a vpnc-script:
//! ```bash
//! sudo openconnect gateway.example.com -s 'vpn-slice 10.0.0.0/8 intranet.example.com'
//! ```

pub mod config;
pub mod platform;
pub mod vpn;
pub mod vpnc;

pub use config::Config;
pub use vpnc::{handle_script_mode, ConnectMode, Intent, Options, SessionEnv};

//! Configuration handling for vpn-slice
//!
//! An optional TOML file supplies defaults for the command-line options, so
//! the vpnc-script line can stay short. Example:
//!
//! ```toml
//! name = "work"
//! domains = ["corp.example"]
//! routes = ["10.0.0.0/8", "git.corp.example", "wiki=10.1.2.3"]
//! route_splits = true
//! ```

use crate::vpnc::intent::{parse_routes, Options, RouteSpecError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid route in config: {0}")]
    RouteError(#[from] RouteSpecError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub routes: Vec<String>,
    pub kill: Vec<PathBuf>,
    pub name: Option<String>,
    pub domains: Vec<String>,
    pub banner: bool,
    pub incoming: bool,
    pub route_internal: bool,
    pub route_splits: bool,
    pub host_names: bool,
    pub short_names: bool,
    pub ns_hosts: bool,
    pub nbns: bool,
    /// Run post-connect work in the background
    pub fork: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            kill: Vec::new(),
            name: None,
            domains: Vec::new(),
            banner: false,
            incoming: false,
            route_internal: false,
            route_splits: false,
            host_names: true,
            short_names: true,
            ns_hosts: true,
            nbns: false,
            fork: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Where to look when no file is named: the working directory, then
    /// `~/.vpn-slice/config.toml`
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("vpn-slice.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".vpn-slice").join("config.toml"));
        }
        paths
    }

    /// Load the named file, or the first default path that exists, or fall
    /// back to built-in defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::discover_in(explicit, &Self::default_paths())
    }

    fn discover_in(explicit: Option<&Path>, candidates: &[PathBuf]) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            debug!("Loading config from {}", path.display());
            return Self::load(path);
        }

        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                Self::load(path)
            }
            None => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Options as this file describes them, before command-line overrides
    pub fn to_options(&self) -> Result<Options, ConfigError> {
        Ok(Options {
            routes: parse_routes(self.routes.as_slice())?,
            kill: self.kill.clone(),
            name: self.name.clone(),
            domains: (!self.domains.is_empty()).then(|| self.domains.clone()),
            banner: self.banner,
            incoming: self.incoming,
            route_internal: self.route_internal,
            route_splits: self.route_splits,
            host_names: self.host_names,
            short_names: self.short_names,
            ns_hosts: self.ns_hosts,
            nbns: self.nbns,
        })
    }
}

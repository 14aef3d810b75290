//! /etc/hosts file management for VPN hostnames
//!
//! Each VPN gets its own block, delimited by markers carrying the VPN name,
//! so several sessions can share the file and each disconnect only removes
//! its own entries.

use crate::platform::{HostEntry, HostsProvider, PlatformError};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum HostsError {
    #[error("Failed to read hosts file {path}: {source}")]
    ReadError { path: String, source: io::Error },
    #[error("Failed to write hosts file {path}: {source}")]
    WriteError { path: String, source: io::Error },
}

const HOSTS_MARKER: &str = "vpn-slice";

pub struct HostsManager {
    path: PathBuf,
}

impl HostsManager {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/etc/hosts"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Replace this VPN's block with `entries`, returning the number of
    /// entries written (or removed, when `entries` is empty).
    pub fn write_entries(&self, entries: &[HostEntry], name: &str) -> Result<usize, HostsError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(HostsError::ReadError {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        let (cleaned, removed) = remove_managed_section(&content, name);
        let new_content = update_content(&cleaned, entries, name);

        if new_content != content {
            fs::write(&self.path, new_content).map_err(|source| HostsError::WriteError {
                path: self.path.display().to_string(),
                source,
            })?;
        }

        debug!(
            "Hosts block '{}': removed {}, wrote {}",
            name,
            removed,
            entries.len()
        );
        Ok(if entries.is_empty() { removed } else { entries.len() })
    }
}

impl Default for HostsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HostsProvider for HostsManager {
    fn write_hosts(&self, host_map: &[HostEntry], name: &str) -> Result<usize, PlatformError> {
        Ok(self.write_entries(host_map, name)?)
    }
}

fn marker_start(name: &str) -> String {
    format!("# BEGIN {} {}", HOSTS_MARKER, name)
}

fn marker_end(name: &str) -> String {
    format!("# END {} {}", HOSTS_MARKER, name)
}

/// Append a block for `name` holding `entries`; nothing is added when empty.
fn update_content(cleaned: &str, entries: &[HostEntry], name: &str) -> String {
    if entries.is_empty() {
        return cleaned.to_string();
    }

    let mut result = cleaned.trim_end().to_string();
    if !result.is_empty() {
        result.push_str("\n\n");
    }
    result.push_str(&marker_start(name));
    result.push('\n');
    for (ip, names) in entries {
        result.push_str(&format!("{}\t{}\n", ip, names.join(" ")));
    }
    result.push_str(&marker_end(name));
    result.push('\n');
    result
}

/// Strip the block for `name`, returning the remaining text and the number
/// of entry lines that were in it.
fn remove_managed_section(content: &str, name: &str) -> (String, usize) {
    let start = marker_start(name);
    let end = marker_end(name);
    let mut result = String::new();
    let mut in_managed_section = false;
    let mut found = false;
    let mut removed = 0;

    for line in content.lines() {
        if line.trim() == start {
            in_managed_section = true;
            found = true;
            continue;
        }
        if line.trim() == end {
            in_managed_section = false;
            continue;
        }
        if in_managed_section {
            if !line.trim().is_empty() && !line.trim_start().starts_with('#') {
                removed += 1;
            }
        } else {
            result.push_str(line);
            result.push('\n');
        }
    }

    // Drop the blank separator the block was written with
    if found {
        result.truncate(result.trim_end().len());
        if !result.is_empty() {
            result.push('\n');
        }
    }

    (result, removed)
}

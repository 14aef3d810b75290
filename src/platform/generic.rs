//! Providers for platforms that have nothing to do for a capability

use super::{FirewallProvider, PlatformError, TunnelPrepProvider};
use tracing::debug;

/// Firewall provider that leaves inbound traffic alone
pub struct NoFirewallProvider;

impl FirewallProvider for NoFirewallProvider {
    fn configure_firewall(&self, device: &str) -> Result<(), PlatformError> {
        debug!("No firewall support here, not blocking inbound traffic on {}", device);
        Ok(())
    }

    fn deconfigure_firewall(&self, _device: &str) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Tunnel devices need no preparation
pub struct NoTunnelPrepProvider;

impl TunnelPrepProvider for NoTunnelPrepProvider {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_firewall_is_noop() {
        let fw = NoFirewallProvider;
        assert!(fw.configure_firewall("utun9").is_ok());
        assert!(fw.deconfigure_firewall("utun9").is_ok());
    }

    #[test]
    fn test_no_tunnel_prep_is_noop() {
        let prep = NoTunnelPrepProvider;
        assert!(prep.create_tunnel().is_ok());
        assert!(prep.prepare_tunnel().is_ok());
    }
}

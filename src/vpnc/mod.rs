//! vpnc-script integration module
//!
//! VPN clients such as OpenConnect and vpnc invoke our binary as their
//! vpnc-script, with environment variables describing the connection.
//!
//! # Usage
//!
//! ```bash
//! sudo openconnect gateway.example.com \
//!   -s 'vpn-slice 192.168.1.0/24 hostname1 alias2=alias2.bigcorp.com=192.168.1.43'
//! ```
//!
//! # Lifecycle
//!
//! The client calls the script with `reason` set to:
//! - `pre-init`: before the tunnel device exists
//! - `connect`: VPN tunnel is established, configure routing
//! - `disconnect`: VPN is shutting down, cleanup
//! - `reconnect` / `attempt-reconnect`: ignored

pub mod dump;
pub mod env;
pub mod intent;
pub mod script;

pub use env::{EnvError, Reason, SessionEnv};
pub use intent::{Intent, Options, RouteSpec};
pub use script::{handle_script_mode, ConnectMode, ScriptError};

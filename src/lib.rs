//! SSHTunnel - SSH tunnel client with HTTP(S) payload proxies
//!
//! Connects to an SSH server, directly or through an HTTP(S) proxy that is sent a
//! templated payload (with optional SNI spoofing), verifies the server with a
//! trust-on-first-use key store, and exposes a local SOCKS5/HTTP forwarder that a
//! virtual network interface routes traffic into.

pub mod config;
pub mod forwarding;
pub mod ssh;
pub mod state;
pub mod tunnel;
pub mod vpn;

pub use config::TunnelConfig;
pub use tunnel::{ConnectionState, TunnelError, TunnelEvent, TunnelService, TunnelStatus};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: `RUST_LOG` if set, otherwise `info`.
///
/// Only binaries call this; library code never installs a subscriber.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

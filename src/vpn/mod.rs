//! Virtual network interface collaborator
//!
//! The platform VPN API (address, routes, DNS, HTTP proxy) sits behind
//! `VirtualInterface`. The tunnel only needs it to point the system's traffic
//! at the local forwarder and to close it again.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("VPN permission was not granted by the user")]
    PermissionDenied,

    #[error("Failed to establish virtual interface: {0}")]
    Platform(String),
}

/// Everything the platform call needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    pub session_name: String,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub route: IpAddr,
    pub route_prefix_len: u8,
    pub dns_server: IpAddr,
    /// Where the system sends its traffic: the local forwarder
    pub http_proxy: SocketAddr,
}

impl InterfaceConfig {
    /// `10.8.0.1/24`, default route, DNS `8.8.8.8`, proxy = `proxy`
    pub fn for_proxy(proxy: SocketAddr) -> Self {
        Self {
            session_name: "SSHTunnel VPN".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1)),
            prefix_len: 24,
            route: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            route_prefix_len: 0,
            dns_server: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            http_proxy: proxy,
        }
    }
}

/// An established interface
pub trait InterfaceHandle: Send + Sync {
    /// Tear the interface down; failures are swallowed
    fn close(self: Box<Self>);
}

/// Platform capability that turns an [`InterfaceConfig`] into a live interface
pub trait VirtualInterface: Send + Sync {
    fn establish(&self, config: &InterfaceConfig) -> Result<Box<dyn InterfaceHandle>, VpnError>;
}

/// For hosts without a VPN API: logs the request and hands back a no-op handle.
/// Applications then point at the forwarder themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterface;

struct LoggingHandle {
    session_name: String,
}

impl InterfaceHandle for LoggingHandle {
    fn close(self: Box<Self>) {
        info!("Virtual interface '{}' closed", self.session_name);
    }
}

impl VirtualInterface for LoggingInterface {
    fn establish(&self, config: &InterfaceConfig) -> Result<Box<dyn InterfaceHandle>, VpnError> {
        info!(
            "Virtual interface '{}': {}/{} route {}/{} dns {} proxy {}",
            config.session_name,
            config.address,
            config.prefix_len,
            config.route,
            config.route_prefix_len,
            config.dns_server,
            config.http_proxy
        );
        Ok(Box::new(LoggingHandle {
            session_name: config.session_name.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_defaults() {
        let proxy: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let config = InterfaceConfig::for_proxy(proxy);
        assert_eq!(config.session_name, "SSHTunnel VPN");
        assert_eq!(config.address.to_string(), "10.8.0.1");
        assert_eq!(config.prefix_len, 24);
        assert_eq!(config.route.to_string(), "0.0.0.0");
        assert_eq!(config.route_prefix_len, 0);
        assert_eq!(config.dns_server.to_string(), "8.8.8.8");
        assert_eq!(config.http_proxy, proxy);
    }

    #[test]
    fn test_logging_interface() {
        let config = InterfaceConfig::for_proxy("127.0.0.1:1080".parse().unwrap());
        let handle = LoggingInterface.establish(&config).unwrap();
        handle.close();
    }
}

//! Configuration Management Module
//!
//! Tunnel connection settings and their on-disk locations.

pub mod storage;
pub mod tunnel;

pub use storage::{config_dir, known_hosts_file, tunnel_file, ConfigStorage};
pub use tunnel::{ConfigError, ProxyTarget, TunnelConfig, DEFAULT_LOCAL_FORWARD_ADDR};

//! Port Forwarding Module
//!
//! The local forwarder: one listener speaking SOCKS5 and HTTP proxy, tunnelling
//! each accepted connection through the SSH session.

mod dynamic;
mod http;

pub use dynamic::{
    start_dynamic_forward, DynamicForward, DynamicForwardHandle, ForwardStats, TunnelConnector,
};

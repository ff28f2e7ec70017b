//! SSH module - handles the tunnel's SSH session
//!
//! This module provides the core SSH functionality using the russh library.
//!
//! # Features
//! - Direct connections or HTTP(S) payload proxies with SNI spoofing
//! - Host key verification against the TOFU trust store
//! - Password authentication
//! - Single-owner handle task serving direct-tcpip channels

mod client;
mod error;
mod establish;
mod handle_owner;
pub mod known_hosts;
mod proxy;
mod tls;

pub use client::{ChallengeSlot, ClientHandler};
pub use error::SshError;
pub use establish::{
    ActiveTunnel, EstablishedTunnel, ProgressSink, SessionEstablisher, SshTunnelEstablisher,
};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{ChallengeKind, HostKeyChallenge, HostKeyDecision, PresentedKey};
pub use proxy::{
    check_status_line, read_header_block, render_payload, BoxedStream, ProxyDialer, ProxyError,
    TransportStream, MAX_PROXY_RESPONSE_BYTES,
};

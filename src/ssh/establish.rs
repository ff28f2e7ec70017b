//! SSH Session Establisher
//!
//! Runs one connection attempt from socket to live forwarder:
//!
//! 1. Transport: direct TCP, or the payload proxy dialer
//! 2. SSH handshake with trust-store host key verification
//! 3. Password authentication
//! 4. Handle moves into its owner task
//! 5. Local forwarder bound on `localForwardAddr`
//!
//! Any failure drops everything opened so far; nothing stays half connected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::proxy::{BoxedStream, ProxyDialer};
use crate::config::TunnelConfig;
use crate::forwarding::{start_dynamic_forward, DynamicForward, DynamicForwardHandle, ForwardStats};
use crate::state::TrustStore;

/// Receives stage progress while an attempt runs
pub trait ProgressSink: Send + Sync {
    /// The byte stream to the SSH server is open; SSH negotiation starts next
    fn transport_ready(&self, message: String);
}

/// A connected session with its forwarder
#[async_trait]
pub trait ActiveTunnel: Send + Sync {
    /// Where the local forwarder listens
    fn local_addr(&self) -> SocketAddr;

    fn stats(&self) -> ForwardStats;

    /// Resolves when the SSH connection goes away
    async fn closed(&self);

    /// Stop the forwarder, then disconnect the session
    async fn shutdown(self: Box<Self>);
}

/// Produces an [`ActiveTunnel`] from a config
#[async_trait]
pub trait SessionEstablisher: Send + Sync {
    async fn establish(
        &self,
        config: &TunnelConfig,
        progress: &dyn ProgressSink,
    ) -> Result<Box<dyn ActiveTunnel>, SshError>;
}

/// The production establisher: russh over TCP or the payload proxy
pub struct SshTunnelEstablisher {
    trust_store: Arc<dyn TrustStore>,
    ssh_config: Arc<client::Config>,
}

impl SshTunnelEstablisher {
    pub fn new(trust_store: Arc<dyn TrustStore>) -> Self {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            // Disconnect after 3 missed keepalives
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            trust_store,
            ssh_config: Arc::new(ssh_config),
        }
    }

    async fn open_transport(
        &self,
        config: &TunnelConfig,
        timeout: Duration,
    ) -> Result<(BoxedStream, String), SshError> {
        if let Some(dialer) = ProxyDialer::from_config(config) {
            let stream = dialer.dial(&config.host, config.port).await?;
            return Ok((stream, format!("proxy {}", dialer.proxy_addr())));
        }

        let addr = config.ssh_addr();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        Ok((Box::new(stream), addr))
    }
}

#[async_trait]
impl SessionEstablisher for SshTunnelEstablisher {
    async fn establish(
        &self,
        config: &TunnelConfig,
        progress: &dyn ProgressSink,
    ) -> Result<Box<dyn ActiveTunnel>, SshError> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let (stream, via) = self.open_transport(config, timeout).await?;
        progress.transport_ready(format!("Connected to {}, authenticating", via));

        let handler = ClientHandler::new(
            &config.host,
            config.port,
            self.trust_store.clone(),
            config.trusted_key().map(str::to_string),
        );
        let challenge_slot = handler.challenge_slot();

        let handshake = tokio::time::timeout(
            timeout,
            client::connect_stream(self.ssh_config.clone(), stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("SSH handshake timed out".to_string()))?;

        let mut handle = match handshake {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(challenge) = challenge_slot.lock().take() {
                    return Err(SshError::HostKeyNotTrusted(Box::new(challenge)));
                }
                return Err(match e {
                    SshError::ProtocolError(message) => {
                        SshError::ConnectionFailed(format!("SSH handshake failed: {}", message))
                    }
                    other => other,
                });
            }
        };

        debug!("SSH handshake completed");

        let authenticated = tokio::time::timeout(
            timeout,
            handle.authenticate_password(&config.username, &config.password),
        )
        .await
        .map_err(|_| SshError::Timeout("Authentication timed out".to_string()))?
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", config.username);

        let label = format!("{}@{}", config.username, config.ssh_addr());
        let controller = spawn_handle_owner_task(handle, label);

        let forward = match start_dynamic_forward(
            Arc::new(controller.clone()),
            DynamicForward::new(&config.local_forward_addr),
            controller.subscribe_disconnect(),
        )
        .await
        {
            Ok(forward) => forward,
            Err(e) => {
                controller.disconnect().await;
                return Err(e);
            }
        };

        Ok(Box::new(EstablishedTunnel {
            controller,
            forward,
            shut_down: false,
        }))
    }
}

/// Owns the session controller and the forwarder of one live connection
pub struct EstablishedTunnel {
    controller: HandleController,
    forward: DynamicForwardHandle,
    shut_down: bool,
}

#[async_trait]
impl ActiveTunnel for EstablishedTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.forward.bound_addr
    }

    fn stats(&self) -> ForwardStats {
        self.forward.stats()
    }

    async fn closed(&self) {
        self.controller.closed().await
    }

    async fn shutdown(self: Box<Self>) {
        let mut this = self;
        this.forward.stop().await;
        this.controller.disconnect().await;
        this.shut_down = true;
        info!("Tunnel on {} shut down", this.forward.bound_addr);
    }
}

impl Drop for EstablishedTunnel {
    fn drop(&mut self) {
        // Aborted without shutdown(); the disconnect also stops the forwarder
        if !self.shut_down {
            self.controller.request_disconnect();
        }
    }
}

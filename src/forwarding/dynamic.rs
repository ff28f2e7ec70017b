//! Dynamic Port Forwarding
//!
//! The local egress point of the tunnel. A listener on `localForwardAddr`
//! accepts SOCKS5 and HTTP proxy clients and tunnels every connection through
//! an SSH direct-tcpip channel to the destination the client asked for.
//! Example: 127.0.0.1:1080 -> SSH tunnel -> any destination

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::http;
use crate::config::DEFAULT_LOCAL_FORWARD_ADDR;
use crate::ssh::{BoxedStream, HandleController, SshError};

/// Forward statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (to remote)
    pub bytes_sent: u64,
    /// Total bytes received (from remote)
    pub bytes_received: u64,
}

pub(crate) type SharedStats = Arc<parking_lot::RwLock<ForwardStats>>;

/// SOCKS5 protocol constants
#[allow(dead_code)]
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// Opens a byte stream to `host:port` on the far side of the tunnel
#[async_trait]
pub trait TunnelConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, SshError>;
}

#[async_trait]
impl TunnelConnector for HandleController {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, SshError> {
        let channel = self
            .open_direct_tcpip(
                host,
                port as u32,
                &originator.ip().to_string(),
                originator.port() as u32,
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Dynamic port forwarding configuration
#[derive(Debug, Clone)]
pub struct DynamicForward {
    /// Local address to bind (e.g., "127.0.0.1:1080")
    pub local_addr: String,
}

impl DynamicForward {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
        }
    }
}

impl Default for DynamicForward {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_FORWARD_ADDR)
    }
}

/// Handle to a running dynamic forward
pub struct DynamicForwardHandle {
    /// Actual bound address
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: SharedStats,
}

impl DynamicForwardHandle {
    /// Stop accepting, close open connections and wait (bounded) for them to finish
    pub async fn stop(&self) {
        info!("Stopping local forwarder on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;

        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_secs(5);
        while self.stats.read().active_connections > 0 {
            if start.elapsed() > timeout {
                warn!(
                    "Timeout waiting for {} active connections to close on {}",
                    self.stats.read().active_connections,
                    self.bound_addr
                );
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Map a bind failure to a message the user can act on
fn bind_error(local_addr: &str, e: std::io::Error) -> SshError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::Forward(format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::Forward(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::Forward(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        )),
        _ => SshError::Forward(format!(
            "Failed to bind local forwarder to {}: {}",
            local_addr, e
        )),
    }
}

/// Start the local forwarder
///
/// 1. Binds the listener
/// 2. Sniffs each client: SOCKS5 greeting or HTTP request
/// 3. Opens a tunnel stream to the requested destination
/// 4. Bridges the two until either side closes
///
/// The listener stops on `stop()` or when `disconnect_rx` fires.
pub async fn start_dynamic_forward(
    connector: Arc<dyn TunnelConnector>,
    config: DynamicForward,
    mut disconnect_rx: broadcast::Receiver<()>,
) -> Result<DynamicForwardHandle, SshError> {
    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| bind_error(&config.local_addr, e))?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::Forward(format!("Failed to get bound address: {}", e)))?;

    info!("Started local forwarder (SOCKS5/HTTP) on {}", bound_addr);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stats: SharedStats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let stats_clone = stats.clone();
    // Fires when the listener exits; open bridges end with it
    let (closing_tx, _) = broadcast::channel::<()>(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local forwarder stopped: SSH disconnected");
                    break;
                }

                _ = stop_rx.recv() => {
                    info!("Local forwarder stopped by request");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break;
                            }

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("Forwarder: accepted connection from {}", peer_addr);

                            {
                                let mut s = stats_clone.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let connector = connector.clone();
                            let stats_for_conn = stats_clone.clone();
                            let mut closing_rx = closing_tx.subscribe();

                            tokio::spawn(async move {
                                let result = tokio::select! {
                                    result = handle_client(connector.as_ref(), stream, peer_addr, &stats_for_conn) => result,
                                    _ = closing_rx.recv() => {
                                        debug!("Closing forwarded connection from {}", peer_addr);
                                        Ok(())
                                    }
                                };

                                {
                                    let mut s = stats_for_conn.write();
                                    s.active_connections = s.active_connections.saturating_sub(1);
                                }

                                if let Err(e) = result {
                                    warn!("Forwarded connection from {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Forwarder accept error: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
        let _ = closing_tx.send(());
        info!("Local forwarder task exited");
    });

    Ok(DynamicForwardHandle {
        bound_addr,
        running,
        stop_tx,
        stats,
    })
}

/// Route a client by its first byte
async fn handle_client(
    connector: &dyn TunnelConnector,
    stream: TcpStream,
    peer_addr: SocketAddr,
    stats: &SharedStats,
) -> Result<(), SshError> {
    let mut first = [0u8; 1];
    let n = stream
        .peek(&mut first)
        .await
        .map_err(|e| SshError::Forward(format!("Failed to read from client: {}", e)))?;
    if n == 0 {
        return Ok(());
    }

    if first[0] == socks5::VERSION {
        handle_socks5_connection(connector, stream, peer_addr, stats).await
    } else if first[0].is_ascii_alphabetic() {
        http::handle_http_connection(connector, stream, peer_addr, stats).await
    } else {
        Err(SshError::Forward(format!(
            "Unrecognized client protocol (first byte 0x{:02x})",
            first[0]
        )))
    }
}

/// Handle a single SOCKS5 connection
async fn handle_socks5_connection(
    connector: &dyn TunnelConnector,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stats: &SharedStats,
) -> Result<(), SshError> {
    let (dest_host, dest_port) = socks5_handshake(&mut stream).await?;

    debug!("SOCKS5: Connecting to {}:{}", dest_host, dest_port);

    let remote = match connector.connect(&dest_host, dest_port, peer_addr).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                "Failed to open tunnel to {}:{}: {}",
                dest_host, dest_port, e
            );
            send_socks5_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_socks5_reply(&mut stream, socks5::REP_SUCCESS).await?;

    debug!("SOCKS5: Tunnel established to {}:{}", dest_host, dest_port);

    bridge(stream, remote, stats).await
}

/// Greeting, no-auth negotiation and CONNECT request; returns the destination
async fn socks5_handshake<S>(stream: &mut S) -> Result<(String, u16), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];

    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| SshError::Forward(format!("Failed to read SOCKS5 greeting: {}", e)))?;

    let version = buf[0];
    let nmethods = buf[1] as usize;

    if version != socks5::VERSION {
        return Err(SshError::Forward(format!(
            "Unsupported SOCKS version: {}",
            version
        )));
    }

    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| SshError::Forward(format!("Failed to read auth methods: {}", e)))?;

    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await
            .ok();
        return Err(SshError::Forward(
            "Client doesn't support NO AUTH method".into(),
        ));
    }

    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| SshError::Forward(format!("Failed to send auth response: {}", e)))?;

    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| SshError::Forward(format!("Failed to read SOCKS5 request: {}", e)))?;

    let version = buf[0];
    let cmd = buf[1];
    // buf[2] is reserved
    let atyp = buf[3];

    if version != socks5::VERSION {
        return Err(SshError::Forward("Invalid SOCKS5 version in request".into()));
    }

    if cmd != socks5::CMD_CONNECT {
        send_socks5_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SshError::Forward(format!(
            "Unsupported SOCKS5 command: {}",
            cmd
        )));
    }

    let destination = match atyp {
        socks5::ATYP_IPV4 => {
            stream
                .read_exact(&mut buf[..6])
                .await
                .map_err(|e| SshError::Forward(format!("Failed to read IPv4 address: {}", e)))?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (ip.to_string(), port)
        }
        socks5::ATYP_DOMAIN => {
            stream
                .read_exact(&mut buf[..1])
                .await
                .map_err(|e| SshError::Forward(format!("Failed to read domain length: {}", e)))?;
            let domain_len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..domain_len + 2])
                .await
                .map_err(|e| SshError::Forward(format!("Failed to read domain: {}", e)))?;
            let domain = String::from_utf8_lossy(&buf[..domain_len]).to_string();
            let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
            (domain, port)
        }
        socks5::ATYP_IPV6 => {
            stream
                .read_exact(&mut buf[..18])
                .await
                .map_err(|e| SshError::Forward(format!("Failed to read IPv6 address: {}", e)))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (ip.to_string(), port)
        }
        _ => {
            send_socks5_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SshError::Forward(format!(
                "Unsupported address type: {}",
                atyp
            )));
        }
    };

    Ok(destination)
}

/// Send a SOCKS5 reply (bound address is always 0.0.0.0:0)
async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> Result<(), SshError>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    stream
        .write_all(&reply)
        .await
        .map_err(|e| SshError::Forward(format!("Failed to send SOCKS5 reply: {}", e)))
}

/// Bridge data between the local client and the tunnel stream
pub(crate) async fn bridge(
    mut local: TcpStream,
    mut remote: BoxedStream,
    stats: &SharedStats,
) -> Result<(), SshError> {
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => {
            let mut s = stats.write();
            s.bytes_sent += sent;
            s.bytes_received += received;
            debug!(
                "Forwarded connection closed ({} bytes out, {} bytes in)",
                sent, received
            );
        }
        Err(e) => {
            debug!("Forwarded connection ended with error: {}", e);
        }
    }

    let _ = remote.shutdown().await;
    Ok(())
}

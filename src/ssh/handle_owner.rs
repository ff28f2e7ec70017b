//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. The local forwarder and the
//! orchestrator talk to it through a cloneable `HandleController`, which sends
//! commands over an mpsc channel and gets replies on oneshot channels.
//!
//! The owner task also watches the handle itself, so a server-side close is
//! noticed without anyone sending a command.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, attempt_id);
//! let channel = controller.open_direct_tcpip("example.com", 443, "127.0.0.1", 50000).await?;
//! controller.closed().await; // resolves once the SSH connection is gone
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the server closed the connection
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (one per forwarded client connection)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies the senders). Any holder has full control of the
/// session, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the SSH connection is closed
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    #[cfg(test)]
    pub(crate) fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Subscribe to SSH disconnect notifications.
    ///
    /// Use in `tokio::select!` next to the work that depends on the session.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Resolves once the SSH connection is closed, for whatever reason
    pub async fn closed(&self) {
        let mut disconnect_rx = self.disconnect_tx.subscribe();
        // The owner closes its command queue before it broadcasts
        if !self.is_connected() {
            return;
        }
        let _ = disconnect_rx.recv().await;
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Non-async disconnect for `Drop` paths; a full queue is left to drain on its own
    pub fn request_disconnect(&self) {
        let _ = self.cmd_tx.try_send(HandleCommand::Disconnect);
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle; `label` only shows up in logs.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let result = handle
                            .channel_open_direct_tcpip(
                                &host,
                                port,
                                &originator_host,
                                originator_port,
                            )
                            .await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving direct_tcpip result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for {}", label);
                        break;
                    }
                },
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection for {} closed by the server", label);
                        break;
                    }
                }
            }
        }

        // Close the queue first so `closed()` never misses the broadcast
        drain_pending_commands(&mut cmd_rx);
        let _ = disconnect_tx_clone.send(());

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_after_owner_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        drop(cmd_rx);

        assert!(!controller.is_connected());
        assert!(matches!(
            controller
                .open_direct_tcpip("example.com", 80, "127.0.0.1", 1234)
                .await,
            Err(SshError::Disconnected)
        ));
        // Returns immediately instead of waiting for a broadcast
        controller.closed().await;
    }

    #[tokio::test]
    async fn test_drain_replies_disconnected() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        let pending = tokio::spawn(async move {
            controller
                .open_direct_tcpip("example.com", 80, "127.0.0.1", 1234)
                .await
        });

        // Wait until the command is queued, then drain like the owner does on exit
        while cmd_rx.is_empty() {
            tokio::task::yield_now().await;
        }
        drain_pending_commands(&mut cmd_rx);

        assert!(matches!(
            pending.await.unwrap(),
            Err(SshError::ChannelError(_))
        ));
    }
}

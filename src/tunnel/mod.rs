//! Tunnel Service
//!
//! Drives one connection attempt at a time through
//! `Idle -> Connecting -> Connected`, with `Error -> Disconnected` on failure and
//! `AwaitingHostKeyDecision` when the server key needs the user's approval.
//!
//! # Architecture
//!
//! ```text
//! start(config) ──► worker task (one per attempt, CancellationToken)
//!                     │  SessionEstablisher::establish  (transport, SSH, forwarder)
//!                     │  VirtualInterface::establish    (route traffic to forwarder)
//!                     ▼
//!                   waits for stop() or session loss
//!
//! events ◄── every status change, tagged with the attempt's generation
//! ```
//!
//! Events from an attempt are only delivered while its generation is current, and
//! never after its `disconnected` event.

mod events;
mod state;

pub use events::{TunnelEvent, TunnelStatus};
pub use state::{ConnectionState, TunnelError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TunnelConfig;
use crate::ssh::{ProgressSink, SessionEstablisher};
use crate::vpn::{InterfaceConfig, VirtualInterface};
use events::TunnelEventEmitter;

/// How long `stop()` waits for the worker to tear down before aborting it
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    state: ConnectionState,
    generation: u64,
    /// `disconnected` already went out for the current generation
    finished: bool,
    local_addr: Option<SocketAddr>,
}

/// State shared between the service and its worker
struct Shared {
    inner: Mutex<Inner>,
    events: TunnelEventEmitter,
}

impl Shared {
    /// Start a new generation; anything still running under the old one goes quiet
    fn begin(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.state = ConnectionState::Idle;
        inner.finished = false;
        inner.local_addr = None;
        inner.generation
    }

    /// Apply a state change and emit its event, unless the attempt is stale
    fn transition(&self, generation: u64, state: ConnectionState, event: TunnelEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.finished {
            return false;
        }
        inner.state = state;
        if state == ConnectionState::Disconnected {
            inner.finished = true;
            inner.local_addr = None;
        }
        // Emitted under the lock so events keep the order of transitions
        self.events.emit(event);
        true
    }

    fn set_local_addr(&self, generation: u64, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.local_addr = Some(addr);
        }
    }

    /// Turn a failure into its one outgoing event (plus `disconnected`)
    fn fail(&self, generation: u64, err: TunnelError) {
        match err {
            TunnelError::HostKeyNotTrusted(challenge) => {
                self.transition(
                    generation,
                    ConnectionState::AwaitingHostKeyDecision,
                    TunnelEvent::HostKey(*challenge),
                );
            }
            other => {
                let message = other.to_string();
                if self.transition(
                    generation,
                    ConnectionState::Error,
                    TunnelEvent::status(TunnelStatus::Error, message),
                ) {
                    self.disconnected(generation);
                }
            }
        }
    }

    fn disconnected(&self, generation: u64) {
        self.transition(
            generation,
            ConnectionState::Disconnected,
            TunnelEvent::status(TunnelStatus::Disconnected, "Tunnel disconnected"),
        );
    }
}

/// Reports the establisher's progress as a second `connecting` event
struct AttemptProgress {
    shared: Arc<Shared>,
    generation: u64,
}

impl ProgressSink for AttemptProgress {
    fn transport_ready(&self, message: String) {
        self.shared.transition(
            self.generation,
            ConnectionState::Connecting,
            TunnelEvent::status(TunnelStatus::Connecting, message),
        );
    }
}

struct Worker {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the lifecycle of the tunnel
///
/// `start` and `stop` are serialized against each other; neither blocks on the
/// connection itself. Status arrives on the event receiver returned by `new`.
pub struct TunnelService {
    establisher: Arc<dyn SessionEstablisher>,
    interface: Arc<dyn VirtualInterface>,
    shared: Arc<Shared>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl TunnelService {
    pub fn new(
        establisher: Arc<dyn SessionEstablisher>,
        interface: Arc<dyn VirtualInterface>,
    ) -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                generation: 0,
                finished: false,
                local_addr: None,
            }),
            events: TunnelEventEmitter::new(tx),
        });

        let service = Self {
            establisher,
            interface,
            shared,
            worker: tokio::sync::Mutex::new(None),
        };
        (service, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// An attempt is connecting or connected
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Forwarder address while connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().local_addr
    }

    /// Begin a new attempt, replacing any previous one.
    ///
    /// Returns once the worker is scheduled. A config error is reported both as
    /// `error` + `disconnected` events and as the return value; no I/O happens.
    pub async fn start(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let mut slot = self.worker.lock().await;
        self.stop_worker(&mut slot).await;

        let generation = self.shared.begin();

        if let Err(e) = config.validate() {
            warn!("Tunnel config rejected: {}", e);
            let err = TunnelError::Config(e);
            self.shared.transition(
                generation,
                ConnectionState::Error,
                TunnelEvent::status(TunnelStatus::Error, err.to_string()),
            );
            self.shared.disconnected(generation);
            return Err(err);
        }

        let attempt_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let attempt = Attempt {
            id: attempt_id,
            generation,
            config,
            shared: self.shared.clone(),
            establisher: self.establisher.clone(),
            interface: self.interface.clone(),
            cancel: cancel.clone(),
        };

        info!(
            "Starting tunnel attempt {} (generation {}) to {}",
            attempt_id,
            generation,
            attempt.config.ssh_addr()
        );

        let task = tokio::spawn(attempt.run());
        *slot = Some(Worker {
            generation,
            cancel,
            task,
        });
        Ok(())
    }

    /// Cancel any attempt and end in `Disconnected`. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut slot = self.worker.lock().await;
        self.stop_worker(&mut slot).await;

        let mut inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Disconnected {
            inner.state = ConnectionState::Disconnected;
            inner.finished = true;
            inner.local_addr = None;
            self.shared.events.emit(TunnelEvent::status(
                TunnelStatus::Disconnected,
                "Tunnel disconnected",
            ));
        }
    }

    async fn stop_worker(&self, slot: &mut Option<Worker>) {
        let Some(worker) = slot.take() else {
            return;
        };

        worker.cancel.cancel();
        let mut task = worker.task;
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("Tunnel worker panicked: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    "Tunnel worker (generation {}) did not stop within {:?}, aborting",
                    worker.generation, STOP_TIMEOUT
                );
                task.abort();
            }
        }

        self.shared.disconnected(worker.generation);
    }
}

/// Everything one worker needs
struct Attempt {
    id: Uuid,
    generation: u64,
    config: TunnelConfig,
    shared: Arc<Shared>,
    establisher: Arc<dyn SessionEstablisher>,
    interface: Arc<dyn VirtualInterface>,
    cancel: CancellationToken,
}

impl Attempt {
    fn status(&self, state: ConnectionState, status: TunnelStatus, message: String) {
        self.shared
            .transition(self.generation, state, TunnelEvent::status(status, message));
    }

    async fn run(self) {
        let dial_message = match self.config.proxy() {
            Some(proxy) => format!("Connecting via proxy {}:{}", proxy.host, proxy.port),
            None => format!("Connecting directly to {}", self.config.ssh_addr()),
        };
        self.status(ConnectionState::Connecting, TunnelStatus::Connecting, dial_message);

        let progress = AttemptProgress {
            shared: self.shared.clone(),
            generation: self.generation,
        };

        let established = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Tunnel attempt {} cancelled while connecting", self.id);
                return;
            }
            result = self.establisher.establish(&self.config, &progress) => result,
        };

        let tunnel = match established {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Tunnel attempt {} failed: {}", self.id, e);
                self.shared.fail(self.generation, e.into());
                return;
            }
        };

        let local_addr = tunnel.local_addr();
        let interface = match self
            .interface
            .establish(&InterfaceConfig::for_proxy(local_addr))
        {
            Ok(interface) => interface,
            Err(e) => {
                warn!("Virtual interface for attempt {} failed: {}", self.id, e);
                tunnel.shutdown().await;
                self.shared.fail(self.generation, e.into());
                return;
            }
        };

        self.shared.set_local_addr(self.generation, local_addr);
        self.status(
            ConnectionState::Connected,
            TunnelStatus::Connected,
            format!("Tunnel established, forwarding on {}", local_addr),
        );
        info!("Tunnel attempt {} connected, forwarder on {}", self.id, local_addr);

        let lost = tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tunnel.closed() => true,
        };

        let stats = tunnel.stats();
        interface.close();
        tunnel.shutdown().await;
        info!(
            "Tunnel attempt {} ended: {} connections, {} bytes sent, {} bytes received",
            self.id, stats.connection_count, stats.bytes_sent, stats.bytes_received
        );

        if lost {
            self.shared.fail(self.generation, TunnelError::ConnectionLost);
        }
    }
}

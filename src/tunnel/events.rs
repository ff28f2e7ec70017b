//! Tunnel Event System
//!
//! Status and host-key events for whoever drives the tunnel (UI, CLI).

use serde::Serialize;
use tokio::sync::mpsc;

use crate::ssh::HostKeyChallenge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Connected => write!(f, "connected"),
            TunnelStatus::Error => write!(f, "error"),
            TunnelStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events emitted by `TunnelService`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    Status {
        status: TunnelStatus,
        message: String,
    },
    /// The server presented a key the trust store does not approve
    HostKey(HostKeyChallenge),
}

impl TunnelEvent {
    pub fn status(status: TunnelStatus, message: impl Into<String>) -> Self {
        TunnelEvent::Status {
            status,
            message: message.into(),
        }
    }
}

/// Sends tunnel events; a receiver that went away is not an error
#[derive(Clone)]
pub(crate) struct TunnelEventEmitter {
    tx: mpsc::UnboundedSender<TunnelEvent>,
}

impl TunnelEventEmitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TunnelEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: TunnelEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Tunnel event dropped: no receiver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::ChallengeKind;

    #[test]
    fn test_status_event_shape() {
        let event = TunnelEvent::status(TunnelStatus::Connecting, "Connecting directly to h:22");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["message"], "Connecting directly to h:22");
    }

    #[test]
    fn test_host_key_event_shape() {
        let challenge = HostKeyChallenge {
            hostname: "example.com".to_string(),
            port: 22,
            host_identity: "example.com:22".to_string(),
            fingerprint: "SHA256:abc".to_string(),
            key_string: "AAAA".to_string(),
            key_type: "ssh-ed25519".to_string(),
            kind: ChallengeKind::Changed,
            previous_fingerprint: Some("SHA256:old".to_string()),
        };
        let json = serde_json::to_value(TunnelEvent::HostKey(challenge)).unwrap();
        assert_eq!(json["type"], "hostKey");
        assert_eq!(json["hostname"], "example.com");
        assert_eq!(json["keyString"], "AAAA");
        assert_eq!(json["kind"], "changed");
    }
}

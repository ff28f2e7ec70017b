//! Connection state and the orchestrator-boundary error taxonomy

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::ssh::{HostKeyChallenge, ProxyError, SshError};
use crate::vpn::VpnError;

/// Where the tunnel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Nothing started yet, or a new attempt is about to start
    Idle,
    /// Dialing, negotiating or authenticating
    Connecting,
    /// Session, forwarder and virtual interface are up
    Connected,
    /// The attempt ended on a host key the user has to approve
    AwaitingHostKeyDecision,
    /// The attempt failed; `Disconnected` follows
    Error,
    Disconnected,
}

impl ConnectionState {
    /// An attempt is running
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Why an attempt ended; each maps to exactly one outgoing failure event
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Connect timeout, TLS failure, proxy EOF, SSH transport failure
    #[error("{0}")]
    Transport(String),

    #[error("Proxy rejected the connection: {status_line}")]
    ProxyRejected { status_line: String },

    #[error("{0}")]
    HostKeyNotTrusted(Box<HostKeyChallenge>),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{0}")]
    Interface(#[from] VpnError),

    #[error("SSH connection lost")]
    ConnectionLost,
}

impl From<ProxyError> for TunnelError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Rejected { status_line } => TunnelError::ProxyRejected { status_line },
            other => TunnelError::Transport(other.to_string()),
        }
    }
}

impl From<SshError> for TunnelError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Proxy(proxy) => proxy.into(),
            SshError::HostKeyNotTrusted(challenge) => TunnelError::HostKeyNotTrusted(challenge),
            SshError::AuthenticationFailed(reason) => TunnelError::Authentication(reason),
            other => TunnelError::Transport(other.to_string()),
        }
    }
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_errors_classified() {
        let rejected: TunnelError = SshError::Proxy(ProxyError::Rejected {
            status_line: "HTTP/1.1 403 Forbidden".to_string(),
        })
        .into();
        assert_eq!(
            rejected.to_string(),
            "Proxy rejected the connection: HTTP/1.1 403 Forbidden"
        );

        let eof: TunnelError = SshError::Proxy(ProxyError::UnexpectedEof).into();
        assert!(matches!(eof, TunnelError::Transport(_)));

        let auth: TunnelError = SshError::AuthenticationFailed("denied".to_string()).into();
        assert!(matches!(auth, TunnelError::Authentication(_)));

        let timeout: TunnelError = SshError::Timeout("SSH handshake timed out".to_string()).into();
        assert_eq!(timeout.to_string(), "Timeout: SSH handshake timed out");
    }

    #[test]
    fn test_interface_error_message() {
        let err: TunnelError = VpnError::PermissionDenied.into();
        assert_eq!(err.to_string(), "VPN permission was not granted by the user");
    }

    #[test]
    fn test_state_serializes_camel_case() {
        assert_eq!(
            serde_json::to_value(ConnectionState::AwaitingHostKeyDecision).unwrap(),
            "awaitingHostKeyDecision"
        );
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
    }
}

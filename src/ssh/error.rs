//! SSH Error types

use thiserror::Error;

use super::known_hosts::HostKeyChallenge;
use super::proxy::ProxyError;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The proxy leg failed before SSH started
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Unknown or changed host key; needs a user decision
    #[error("{0}")]
    HostKeyNotTrusted(Box<HostKeyChallenge>),

    #[error("Trust store error: {0}")]
    TrustStore(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Port forward error: {0}")]
    Forward(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<crate::state::StoreError> for SshError {
    fn from(err: crate::state::StoreError) -> Self {
        SshError::TrustStore(err.to_string())
    }
}

// Errors travel to the UI layer as plain strings
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

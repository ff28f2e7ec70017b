//! SSH client handler for russh
//!
//! Applies the trust-store decision in `check_server_key`. Keys that need a user
//! decision abort the handshake; the challenge is also left in a shared slot so
//! the establisher can report it even if russh replaces the handler error with
//! its own.

use std::sync::Arc;

use parking_lot::Mutex;
use russh::client;
use russh::keys::PublicKey;
use tracing::{error, info};

use super::error::SshError;
use super::known_hosts::{verify_host_key, HostKeyChallenge, HostKeyDecision, PresentedKey};
use crate::state::{HostIdentity, TrustStore};

/// Slot the handler leaves a pending challenge in
pub type ChallengeSlot = Arc<Mutex<Option<HostKeyChallenge>>>;

/// Client handler for russh callbacks
pub struct ClientHandler {
    identity: HostIdentity,
    trust_store: Arc<dyn TrustStore>,
    /// Key string the user approved for this attempt
    trusted_key: Option<String>,
    challenge: ChallengeSlot,
}

impl ClientHandler {
    pub fn new(
        host: &str,
        port: u16,
        trust_store: Arc<dyn TrustStore>,
        trusted_key: Option<String>,
    ) -> Self {
        Self {
            identity: HostIdentity::new(host, port),
            trust_store,
            trusted_key,
            challenge: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared handle to the challenge slot; read it after a failed handshake
    pub fn challenge_slot(&self) -> ChallengeSlot {
        self.challenge.clone()
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = PresentedKey::from_public_key(server_public_key);

        let decision = verify_host_key(
            self.trust_store.as_ref(),
            &self.identity,
            &presented,
            self.trusted_key.as_deref(),
        )
        .map_err(|e| {
            error!("Trust store lookup for {} failed: {}", self.identity, e);
            SshError::from(e)
        })?;

        match decision {
            HostKeyDecision::Approved | HostKeyDecision::TrustAndApprove => {
                info!("Host key accepted for {}", self.identity);
                Ok(true)
            }
            HostKeyDecision::Unknown(challenge) | HostKeyDecision::Mismatch(challenge) => {
                *self.challenge.lock() = Some(challenge.clone());
                Err(SshError::HostKeyNotTrusted(Box::new(challenge)))
            }
        }
    }
}

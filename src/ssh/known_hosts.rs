//! Host key verification against the trust store
//!
//! Trust-on-first-use with explicit mismatch detection. A key is only ever
//! written to the store when the user approved exactly that key string; first
//! contact and changed keys both end in a challenge for the user to decide on.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::state::{HostIdentity, StoreError, TrustStore};

/// Why verification could not complete on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    /// No key stored for this host yet
    Unknown,
    /// A different key is stored for this host (potential MITM)
    Changed,
}

/// Pending user decision about a server key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyChallenge {
    pub hostname: String,
    pub port: u16,
    pub host_identity: String,
    /// SHA256 fingerprint of the presented key (e.g., "SHA256:abc123...")
    pub fingerprint: String,
    /// Base64 key string; pass it back as `trustedKey` to accept the key
    pub key_string: String,
    pub key_type: String,
    pub kind: ChallengeKind,
    /// Fingerprint of the stored key, for `Changed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_fingerprint: Option<String>,
}

impl fmt::Display for HostKeyChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChallengeKind::Unknown => write!(
                f,
                "Host key for {} is not trusted yet ({} {})",
                self.host_identity, self.key_type, self.fingerprint
            ),
            ChallengeKind::Changed => write!(
                f,
                "HOST KEY CHANGED for {}: expected {}, got {}. Possible man-in-the-middle attack",
                self.host_identity,
                self.previous_fingerprint.as_deref().unwrap_or("unknown"),
                self.fingerprint
            ),
        }
    }
}

/// Outcome of checking a presented key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Stored key matches
    Approved,
    /// The user approved this key; store it, then continue
    TrustAndApprove,
    Unknown(HostKeyChallenge),
    Mismatch(HostKeyChallenge),
}

/// Key material presented by the server, in the forms the store works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedKey {
    pub key_type: String,
    pub key_string: String,
    pub fingerprint: String,
}

impl PresentedKey {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self::from_key_bytes(key.algorithm().as_str(), &key.public_key_bytes())
    }

    pub fn from_key_bytes(key_type: &str, key_bytes: &[u8]) -> Self {
        Self {
            key_type: key_type.to_string(),
            key_string: BASE64.encode(key_bytes),
            fingerprint: fingerprint_of_bytes(key_bytes),
        }
    }
}

/// `SHA256:<unpadded base64>` of the raw key blob
fn fingerprint_of_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Compute fingerprint from a stored base64 key string
pub fn fingerprint_of_key_string(key_string: &str) -> Option<String> {
    BASE64
        .decode(key_string.trim())
        .ok()
        .map(|bytes| fingerprint_of_bytes(&bytes))
}

/// Pure TOFU decision
///
/// `trusted_override` is the key string the user approved for this attempt;
/// `stored` is what the trust store holds for `identity`.
pub fn decide(
    identity: &HostIdentity,
    presented: &PresentedKey,
    trusted_override: Option<&str>,
    stored: Option<&str>,
) -> HostKeyDecision {
    if trusted_override.map(str::trim) == Some(presented.key_string.as_str()) {
        return HostKeyDecision::TrustAndApprove;
    }

    let challenge = |kind, previous_fingerprint| HostKeyChallenge {
        hostname: identity.host().to_string(),
        port: identity.port(),
        host_identity: identity.to_string(),
        fingerprint: presented.fingerprint.clone(),
        key_string: presented.key_string.clone(),
        key_type: presented.key_type.clone(),
        kind,
        previous_fingerprint,
    };

    match stored {
        Some(stored) if stored.trim() == presented.key_string => HostKeyDecision::Approved,
        Some(stored) => HostKeyDecision::Mismatch(challenge(
            ChallengeKind::Changed,
            Some(fingerprint_of_key_string(stored).unwrap_or_else(|| "unknown".to_string())),
        )),
        None => HostKeyDecision::Unknown(challenge(ChallengeKind::Unknown, None)),
    }
}

/// Look up, decide, and persist an approved key
pub fn verify_host_key(
    store: &dyn TrustStore,
    identity: &HostIdentity,
    presented: &PresentedKey,
    trusted_override: Option<&str>,
) -> Result<HostKeyDecision, StoreError> {
    let host_identity = identity.to_string();
    let stored = store.lookup(&host_identity)?;
    let decision = decide(identity, presented, trusted_override, stored.as_deref());

    match &decision {
        HostKeyDecision::Approved => {
            debug!(
                "Host key verified for {} (type: {})",
                host_identity, presented.key_type
            );
        }
        HostKeyDecision::TrustAndApprove => {
            store.upsert(&host_identity, &presented.key_string)?;
            info!(
                "TOFU: Trusting and saving host key for {} (fingerprint: {})",
                host_identity, presented.fingerprint
            );
        }
        HostKeyDecision::Unknown(challenge) => {
            info!(
                "Unknown host key for {} (fingerprint: {}), waiting for user decision",
                host_identity, challenge.fingerprint
            );
        }
        HostKeyDecision::Mismatch(challenge) => {
            warn!(
                "HOST KEY CHANGED for {}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                host_identity,
                challenge.previous_fingerprint.as_deref().unwrap_or("unknown"),
                challenge.fingerprint
            );
        }
    }

    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryTrustStore;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIHDx2e4XuC98hdevT83pky4OOpCuX/+huXheX1aUNkBR";
    const FINGERPRINT_A: &str = "SHA256:ZC+muJsBxk8FJ+5HkJDIFsJ4F4pV7WXp5bU/8PSpSbY";

    fn presented(key_string: &str) -> PresentedKey {
        let bytes = BASE64.decode(key_string).unwrap();
        PresentedKey::from_key_bytes("ssh-ed25519", &bytes)
    }

    fn other_key() -> PresentedKey {
        PresentedKey::from_key_bytes("ssh-ed25519", b"a completely different key")
    }

    #[test]
    fn test_fingerprint_format() {
        let key = presented(KEY_A);
        assert_eq!(key.key_string, KEY_A);
        assert_eq!(key.fingerprint, FINGERPRINT_A);
        assert_eq!(
            fingerprint_of_key_string(KEY_A).as_deref(),
            Some(FINGERPRINT_A)
        );
        assert_eq!(fingerprint_of_key_string("not base64!"), None);
    }

    #[test]
    fn test_first_contact_is_challenged() {
        let id = HostIdentity::new("example.com", 22);
        match decide(&id, &presented(KEY_A), None, None) {
            HostKeyDecision::Unknown(challenge) => {
                assert_eq!(challenge.kind, ChallengeKind::Unknown);
                assert_eq!(challenge.host_identity, "example.com:22");
                assert_eq!(challenge.fingerprint, FINGERPRINT_A);
                assert_eq!(challenge.key_string, KEY_A);
                assert!(challenge.previous_fingerprint.is_none());
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_matching_key_approved() {
        let id = HostIdentity::new("example.com", 22);
        assert_eq!(
            decide(&id, &presented(KEY_A), None, Some(KEY_A)),
            HostKeyDecision::Approved
        );
    }

    #[test]
    fn test_changed_key_is_mismatch() {
        let id = HostIdentity::new("example.com", 22);
        let new_key = other_key();
        match decide(&id, &new_key, None, Some(KEY_A)) {
            HostKeyDecision::Mismatch(challenge) => {
                assert_eq!(challenge.kind, ChallengeKind::Changed);
                assert_eq!(challenge.key_string, new_key.key_string);
                assert_eq!(challenge.previous_fingerprint.as_deref(), Some(FINGERPRINT_A));
                assert!(challenge.to_string().contains("HOST KEY CHANGED"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_override_for_other_key_does_not_approve() {
        let id = HostIdentity::new("example.com", 22);
        let decision = decide(&id, &presented(KEY_A), Some("AAAAsomethingelse"), None);
        assert!(matches!(decision, HostKeyDecision::Unknown(_)));
    }

    #[test]
    fn test_mismatch_leaves_store_unchanged() {
        let store = MemoryTrustStore::seeded([("example.com:22", KEY_A)]);
        let id = HostIdentity::new("example.com", 22);

        let decision = verify_host_key(&store, &id, &other_key(), None).unwrap();
        assert!(matches!(decision, HostKeyDecision::Mismatch(_)));
        assert_eq!(store.lookup("example.com:22").unwrap().as_deref(), Some(KEY_A));
    }

    #[test]
    fn test_approval_updates_store() {
        let store = MemoryTrustStore::seeded([("example.com:22", KEY_A)]);
        let id = HostIdentity::new("Example.com", 22);
        let new_key = other_key();

        let decision =
            verify_host_key(&store, &id, &new_key, Some(&new_key.key_string)).unwrap();
        assert_eq!(decision, HostKeyDecision::TrustAndApprove);
        assert_eq!(
            store.lookup("example.com:22").unwrap(),
            Some(new_key.key_string.clone())
        );

        // Next connection passes without an override
        let decision = verify_host_key(&store, &id, &new_key, None).unwrap();
        assert_eq!(decision, HostKeyDecision::Approved);
    }

    #[test]
    fn test_challenge_wire_shape() {
        let id = HostIdentity::new("example.com", 2222);
        let HostKeyDecision::Unknown(challenge) = decide(&id, &presented(KEY_A), None, None)
        else {
            panic!("expected challenge");
        };
        let json = serde_json::to_value(&challenge).unwrap();
        assert_eq!(json["hostname"], "example.com");
        assert_eq!(json["keyString"], KEY_A);
        assert_eq!(json["kind"], "unknown");
        assert!(json.get("previousFingerprint").is_none());
    }
}

//! Agent identity: claim id, machine guid and the RSA private key.
//!
//! The claim directory is populated by the claiming flow (a collaborator of
//! this crate). Two files matter here: `claimed_id` holding the cloud-issued
//! claim UUID, and `private.pem` holding the RSA private key used to answer
//! the OTP challenge. The machine guid is supplied by the embedding agent;
//! this crate persists nothing besides reading those files.

use std::path::{Path, PathBuf};

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CLAIMED_ID_FILE: &str = "claimed_id";
pub const PRIVATE_KEY_FILE: &str = "private.pem";

#[derive(Debug, Error)]
pub enum IdentityError {
    /// The agent is claimed but the key file is unusable. Fatal: the core
    /// refuses to start a connection it can never authenticate.
    #[error("Claimed but private key unusable at {path}: {reason}")]
    BadPrivateKey { path: PathBuf, reason: String },

    #[error("Claim id file {path} does not contain a UUID: {content}")]
    BadClaimId { path: PathBuf, content: String },
}

/// Identity snapshot for one connection attempt.
///
/// Rebuilt from disk on every bootstrap so a re-claim (new claim id) is
/// picked up on the next reconnection without restarting the agent.
#[derive(Clone)]
pub struct AgentIdentity {
    pub claim_id: Uuid,
    pub machine_guid: Uuid,
    pub private_key: RsaPrivateKey,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the key itself never goes to logs
        f.debug_struct("AgentIdentity")
            .field("claim_id", &self.claim_id)
            .field("machine_guid", &self.machine_guid)
            .finish_non_exhaustive()
    }
}

impl AgentIdentity {
    /// Reads the claim directory. `Ok(None)` means "not claimed yet" — the
    /// lifecycle keeps waiting. A claim id without a usable key is an error.
    pub fn load(claim_dir: &Path, machine_guid: Uuid) -> Result<Option<Self>, IdentityError> {
        let claim_path = claim_dir.join(CLAIMED_ID_FILE);
        let Ok(raw) = std::fs::read_to_string(&claim_path) else {
            return Ok(None);
        };
        let trimmed = raw.trim();
        let claim_id = Uuid::parse_str(trimmed).map_err(|_| IdentityError::BadClaimId {
            path: claim_path,
            content: trimmed.to_string(),
        })?;

        let key_path = claim_dir.join(PRIVATE_KEY_FILE);
        let pem = std::fs::read_to_string(&key_path).map_err(|e| IdentityError::BadPrivateKey {
            path: key_path.clone(),
            reason: e.to_string(),
        })?;
        let private_key = parse_private_key(&pem).map_err(|reason| {
            IdentityError::BadPrivateKey {
                path: key_path,
                reason,
            }
        })?;

        debug!("Loaded claim identity {claim_id}");
        Ok(Some(Self {
            claim_id,
            machine_guid,
            private_key,
        }))
    }

    pub fn claim_id_str(&self) -> String {
        self.claim_id.to_string()
    }
}

/// PKCS#1 is the documented on-disk format; PKCS#8 keys from older claiming
/// scripts are accepted as well.
fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, String> {
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclaimed_directory_is_not_an_error() {
        let dir = std::env::temp_dir().join(format!("cloudlink-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let loaded = AgentIdentity::load(&dir, Uuid::new_v4()).unwrap();
        assert!(loaded.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn claim_without_key_is_fatal() {
        let dir = std::env::temp_dir().join(format!("cloudlink-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CLAIMED_ID_FILE), Uuid::new_v4().to_string()).unwrap();
        assert!(matches!(
            AgentIdentity::load(&dir, Uuid::new_v4()),
            Err(IdentityError::BadPrivateKey { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn garbage_claim_id_is_rejected() {
        let dir = std::env::temp_dir().join(format!("cloudlink-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CLAIMED_ID_FILE), "not-a-uuid").unwrap();
        assert!(matches!(
            AgentIdentity::load(&dir, Uuid::new_v4()),
            Err(IdentityError::BadClaimId { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}

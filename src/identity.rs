//! Marketplace identity records and the identity pool.
//!
//! Identities are provisioned out-of-band; the dispatcher only loads them.
//! Each identity lives under `${AGENTS_DIR}/<agent_id>/` as a `keys.json`
//! (mode 0600) plus an optional `SOUL.md` persona handed to the sandbox.
//! The pool size, together with the port range, caps parallel jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::IdentityError;
use crate::signing::IdentitySigner;

/// On-disk shape of `keys.json`.
///
/// `wif`, `address` and `i_address` are the marketplace-side representation
/// of the key; the dispatcher signs with the raw ed25519 seed.
#[derive(Deserialize)]
struct KeysFile {
    agent_id: String,
    identity_name: String,
    address: String,
    i_address: String,
    wif: String,
    network: String,
    secret_seed: String,
}

/// One provisioned marketplace identity. Immutable after load.
pub struct Identity {
    pub agent_id: String,
    pub identity_name: String,
    pub address: String,
    pub i_address: String,
    pub wif: String,
    pub network: String,
    /// Persona document passed into the sandbox config tree, if present.
    pub soul: Option<String>,
    signer: IdentitySigner,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("agent_id", &self.agent_id)
            .field("identity_name", &self.identity_name)
            .field("i_address", &self.i_address)
            .field("wif", &"[REDACTED]")
            .field("network", &self.network)
            .finish()
    }
}

impl Identity {
    /// Load one identity from a `keys.json` path, enforcing mode 0600.
    pub fn load(keys_path: &Path) -> Result<Self, IdentityError> {
        check_permissions(keys_path)?;

        let raw = std::fs::read_to_string(keys_path).map_err(|e| IdentityError::KeyFile {
            path: keys_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let keys: KeysFile =
            serde_json::from_str(&raw).map_err(|e| IdentityError::KeyFile {
                path: keys_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let signer = IdentitySigner::from_seed_hex(&keys.secret_seed)?;

        let soul = keys_path
            .parent()
            .map(|dir| dir.join("SOUL.md"))
            .and_then(|p| std::fs::read_to_string(p).ok());

        Ok(Self {
            agent_id: keys.agent_id,
            identity_name: keys.identity_name,
            address: keys.address,
            i_address: keys.i_address,
            wif: keys.wif,
            network: keys.network,
            soul,
            signer,
        })
    }

    pub fn signer(&self) -> &IdentitySigner {
        &self.signer
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), IdentityError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path).map_err(|e| IdentityError::KeyFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(IdentityError::Permissions {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), IdentityError> {
    Ok(())
}

/// The set of identities this dispatcher operates.
///
/// Jobs are discovered per identity (seller-role listing), so each job is
/// bound to its discovering identity at admission. The pool size bounds
/// parallel jobs together with the port range.
#[derive(Debug)]
pub struct IdentityPool {
    all: Vec<Arc<Identity>>,
}

impl IdentityPool {
    /// Load every identity under `agents_dir`, falling back to a single
    /// explicit key file when the directory yields nothing.
    pub fn load(agents_dir: &Path, fallback_keys: Option<&PathBuf>) -> Result<Self, IdentityError> {
        let mut all = Vec::new();

        if agents_dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(agents_dir)
                .map_err(|e| IdentityError::KeyFile {
                    path: agents_dir.display().to_string(),
                    reason: e.to_string(),
                })?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            entries.sort();

            for dir in entries {
                let keys_path = dir.join("keys.json");
                if !keys_path.is_file() {
                    continue;
                }
                match Identity::load(&keys_path) {
                    Ok(identity) => {
                        tracing::info!(
                            agent_id = %identity.agent_id,
                            identity = %identity.identity_name,
                            "Loaded identity"
                        );
                        all.push(Arc::new(identity));
                    }
                    Err(e) => {
                        tracing::warn!(path = %keys_path.display(), error = %e, "Skipping unusable identity");
                    }
                }
            }
        }

        if all.is_empty() {
            if let Some(path) = fallback_keys {
                all.push(Arc::new(Identity::load(path)?));
            }
        }

        if all.is_empty() {
            return Err(IdentityError::PoolEmpty);
        }

        Ok(Self { all })
    }

    /// Build a pool from preconstructed identities (tests).
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, IdentityError> {
        if identities.is_empty() {
            return Err(IdentityError::PoolEmpty);
        }
        Ok(Self {
            all: identities.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn identities(&self) -> &[Arc<Identity>] {
        &self.all
    }

    /// Find an identity by its marketplace name or i-address.
    pub fn by_name(&self, name: &str) -> Option<Arc<Identity>> {
        self.all
            .iter()
            .find(|i| i.identity_name == name || i.i_address == name)
            .cloned()
    }

    /// True when `sender` is one of our own identities.
    pub fn is_self(&self, sender: &str) -> bool {
        self.by_name(sender).is_some()
    }
}

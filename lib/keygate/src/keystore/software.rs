//! Software Keystore - P-256 keys held in process memory, optionally on disk
//!
//! Stands in for the Secure Enclave on hosts without secure hardware and in
//! tests. The presence gate is simulated with a `PresenceCheck`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Keystore;
use super::presence::{AutoApprove, PresenceCheck};
use crate::ecies;
use crate::error::{KeygateError, Result};
use crate::types::{
    AccessPolicy, KeyPairIdentifier, PrivateKeyHandle, PublicKeyBytes, PublicKeyHandle, Signature,
};

const PRIVATE_SUFFIX: &str = ".private.json";
const PUBLIC_SUFFIX: &str = ".public.json";

#[derive(Clone)]
struct PrivateEntry {
    signing_key: SigningKey,
    policy: AccessPolicy,
}

/// On-disk form of a private key entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredPrivateKey {
    label: String,
    scalar: String,
    policy: AccessPolicy,
}

/// On-disk form of a public key entry
#[derive(Debug, Serialize, Deserialize)]
struct StoredPublicKey {
    label: String,
    point: String,
}

pub struct SoftwareKeystore {
    private_keys: RwLock<HashMap<String, PrivateEntry>>,
    public_keys: RwLock<HashMap<String, PublicKeyBytes>>,
    key_dir: Option<PathBuf>,
    presence: Arc<dyn PresenceCheck>,
}

impl Default for SoftwareKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftwareKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKeystore")
            .field("key_dir", &self.key_dir)
            .finish_non_exhaustive()
    }
}

impl SoftwareKeystore {
    // ==================== Constructors ====================

    /// In-memory keystore that approves every presence check.
    pub fn new() -> Self {
        Self::with_presence(Arc::new(AutoApprove))
    }

    pub fn with_presence(presence: Arc<dyn PresenceCheck>) -> Self {
        Self {
            private_keys: RwLock::new(HashMap::new()),
            public_keys: RwLock::new(HashMap::new()),
            key_dir: None,
            presence,
        }
    }

    /// Opens a keystore persisted under `dir`, loading any keys already there.
    pub fn open_dir(dir: &Path, presence: Arc<dyn PresenceCheck>) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            KeygateError::StorageError(format!("Failed to create key directory: {}", e))
        })?;

        let mut private_keys = HashMap::new();
        let mut public_keys = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // Bad entries are skipped so other namespaces still load
            if file_name.ends_with(PRIVATE_SUFFIX) {
                match load_private(&path) {
                    Ok((label, entry)) => {
                        private_keys.insert(label, entry);
                    }
                    Err(e) => warn!(file = %path.display(), error = %e, "Skipping private key file"),
                }
            } else if file_name.ends_with(PUBLIC_SUFFIX) {
                match load_public(&path) {
                    Ok((label, point)) => {
                        public_keys.insert(label, point);
                    }
                    Err(e) => warn!(file = %path.display(), error = %e, "Skipping public key file"),
                }
            }
        }

        debug!(
            dir = %dir.display(),
            private = private_keys.len(),
            public = public_keys.len(),
            "Loaded software keystore"
        );

        Ok(Self {
            private_keys: RwLock::new(private_keys),
            public_keys: RwLock::new(public_keys),
            key_dir: Some(dir.to_path_buf()),
            presence,
        })
    }

    pub fn key_dir(&self) -> Option<&Path> {
        self.key_dir.as_deref()
    }

    fn key_path(&self, label: &str, suffix: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.key_dir else {
            return Ok(None);
        };
        validate_label(label)?;
        Ok(Some(dir.join(format!("{}{}", label, suffix))))
    }

    fn persist_private(&self, label: &str, entry: &PrivateEntry) -> Result<()> {
        let Some(path) = self.key_path(label, PRIVATE_SUFFIX)? else {
            return Ok(());
        };
        let stored = StoredPrivateKey {
            label: label.to_string(),
            scalar: hex::encode(entry.signing_key.to_bytes()),
            policy: entry.policy,
        };
        write_synced(&path, &serde_json::to_string_pretty(&stored)?)
    }

    fn persist_public(&self, label: &str, point: &PublicKeyBytes) -> Result<()> {
        let Some(path) = self.key_path(label, PUBLIC_SUFFIX)? else {
            return Ok(());
        };
        let stored = StoredPublicKey {
            label: label.to_string(),
            point: point.to_hex(),
        };
        write_synced(&path, &serde_json::to_string_pretty(&stored)?)
    }

    fn remove_file(&self, label: &str, suffix: &str) -> Result<()> {
        if let Some(path) = self.key_path(label, suffix)?
            && path.is_file()
        {
            std::fs::remove_file(&path).map_err(|e| {
                KeygateError::StorageError(format!("Failed to delete {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    fn check_presence(&self, entry: &PrivateEntry, prompt: &str) -> Result<()> {
        if entry.policy.user_presence {
            self.presence.confirm(prompt)?;
        }
        Ok(())
    }

    fn private_entry(&self, label: &str) -> Result<Option<PrivateEntry>> {
        let keys = self
            .private_keys
            .read()
            .map_err(|_| KeygateError::KeystoreError("Private key lock poisoned".into()))?;
        Ok(keys.get(label).cloned())
    }
}

// ==================== Keystore impl ====================

impl Keystore for SoftwareKeystore {
    fn name(&self) -> &'static str {
        "software"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn generate_key_pair(
        &self,
        identifier: &KeyPairIdentifier,
        policy: &AccessPolicy,
    ) -> Result<()> {
        let private_label = identifier.private_tag();
        let public_label = identifier.public_tag();

        // Clear both sides before writing so a half-replaced pair is never visible
        self.delete_public_key(public_label)?;
        self.delete_private_key(private_label)?;

        let signing_key = SigningKey::random(&mut OsRng);
        let public = PublicKeyBytes::from_verifying_key(signing_key.verifying_key());
        let entry = PrivateEntry {
            signing_key,
            policy: *policy,
        };

        self.persist_private(private_label, &entry)?;
        if let Err(e) = self.persist_public(public_label, &public) {
            // Never leave a private key on disk without its public half
            if let Err(cleanup) = self.remove_file(private_label, PRIVATE_SUFFIX) {
                warn!(label = private_label, error = %cleanup, "Failed to roll back private key file");
            }
            return Err(e);
        }

        self.private_keys
            .write()
            .map_err(|_| KeygateError::KeystoreError("Private key lock poisoned".into()))?
            .insert(private_label.to_string(), entry);
        self.public_keys
            .write()
            .map_err(|_| KeygateError::KeystoreError("Public key lock poisoned".into()))?
            .insert(public_label.to_string(), public);

        debug!(%identifier, "Generated software key pair");
        Ok(())
    }

    fn find_public_key(&self, label: &str) -> Result<Option<PublicKeyHandle>> {
        let keys = self
            .public_keys
            .read()
            .map_err(|_| KeygateError::KeystoreError("Public key lock poisoned".into()))?;
        Ok(keys.contains_key(label).then(|| PublicKeyHandle::new(label)))
    }

    fn find_private_key(&self, label: &str) -> Result<Option<PrivateKeyHandle>> {
        let keys = self
            .private_keys
            .read()
            .map_err(|_| KeygateError::KeystoreError("Private key lock poisoned".into()))?;
        Ok(keys.contains_key(label).then(|| PrivateKeyHandle::new(label)))
    }

    fn export_public_key(&self, handle: &PublicKeyHandle) -> Result<PublicKeyBytes> {
        let keys = self
            .public_keys
            .read()
            .map_err(|_| KeygateError::KeystoreError("Public key lock poisoned".into()))?;
        keys.get(handle.label())
            .cloned()
            .ok_or_else(|| KeygateError::KeyNotFound(handle.label().to_string()))
    }

    fn authorize(&self, handle: &PrivateKeyHandle, prompt: &str) -> Result<()> {
        let entry = self
            .private_entry(handle.label())?
            .ok_or_else(|| KeygateError::KeyNotFound(handle.label().to_string()))?;
        self.check_presence(&entry, prompt)
    }

    fn sign(&self, handle: &PrivateKeyHandle, data: &[u8], prompt: &str) -> Result<Signature> {
        // Lock is released before the presence check, which may block on the user
        let entry = self
            .private_entry(handle.label())?
            .ok_or_else(|| KeygateError::KeyNotFound(handle.label().to_string()))?;
        self.check_presence(&entry, prompt)?;

        let signature: p256::ecdsa::Signature = entry
            .signing_key
            .try_sign(data)
            .map_err(|e| KeygateError::SigningFailed(e.to_string()))?;
        Ok(Signature::from(signature))
    }

    fn encrypt(&self, handle: &PublicKeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
        let recipient = self.export_public_key(handle)?;
        ecies::encrypt(&recipient, plaintext)
    }

    fn decrypt(
        &self,
        handle: &PrivateKeyHandle,
        ciphertext: &[u8],
        prompt: &str,
    ) -> Result<Vec<u8>> {
        let entry = self
            .private_entry(handle.label())?
            .ok_or_else(|| KeygateError::KeyNotFound(handle.label().to_string()))?;
        self.check_presence(&entry, prompt)?;
        ecies::decrypt(entry.signing_key.as_nonzero_scalar(), ciphertext)
    }

    fn delete_public_key(&self, label: &str) -> Result<()> {
        self.remove_file(label, PUBLIC_SUFFIX)?;
        let removed = self
            .public_keys
            .write()
            .map_err(|_| KeygateError::KeystoreError("Public key lock poisoned".into()))?
            .remove(label);
        if removed.is_none() {
            debug!(label, "Public key already absent");
        }
        Ok(())
    }

    fn delete_private_key(&self, label: &str) -> Result<()> {
        self.remove_file(label, PRIVATE_SUFFIX)?;
        let removed = self
            .private_keys
            .write()
            .map_err(|_| KeygateError::KeystoreError("Private key lock poisoned".into()))?
            .remove(label);
        if removed.is_none() {
            debug!(label, "Private key already absent");
        }
        Ok(())
    }
}

// ==================== Helpers ====================

fn load_private(path: &Path) -> Result<(String, PrivateEntry)> {
    let contents = std::fs::read_to_string(path)?;
    let stored: StoredPrivateKey = serde_json::from_str(&contents)?;
    let scalar = hex::decode(&stored.scalar)?;
    let signing_key = SigningKey::from_slice(&scalar).map_err(|e| {
        KeygateError::StorageError(format!("Corrupt private key {}: {}", stored.label, e))
    })?;
    let entry = PrivateEntry {
        signing_key,
        policy: stored.policy,
    };
    Ok((stored.label, entry))
}

fn load_public(path: &Path) -> Result<(String, PublicKeyBytes)> {
    let contents = std::fs::read_to_string(path)?;
    let stored: StoredPublicKey = serde_json::from_str(&contents)?;
    let point = PublicKeyBytes::from_hex(&stored.point).map_err(|e| {
        KeygateError::StorageError(format!("Corrupt public key {}: {}", stored.label, e))
    })?;
    Ok((stored.label, point))
}

/// Labels become file names, so keep them to a portable character set.
fn validate_label(label: &str) -> Result<()> {
    let valid = !label.is_empty()
        && !label.starts_with('.')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        warn!(label, "Rejected key label");
        Err(KeygateError::KeystoreError(format!(
            "Invalid key label for file storage: {:?}",
            label
        )))
    }
}

fn write_synced(path: &Path, contents: &str) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .map_err(|e| KeygateError::StorageError(format!("Failed to create key file: {}", e)))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| KeygateError::StorageError(format!("Failed to write key file: {}", e)))?;
    file.sync_all()
        .map_err(|e| KeygateError::StorageError(format!("Failed to sync key file: {}", e)))?;
    Ok(())
}

// ==================== Tests ====================

//! Keystore capability - the platform key store behind the façade
//!
//! `Keystore` is the seam between `KeyManager` and whatever actually holds the
//! keys: the Secure Enclave on Apple platforms, or `SoftwareKeystore` for
//! tests and hosts without secure hardware.

mod presence;
mod software;

#[cfg(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
))]
mod secure_enclave;

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    AccessPolicy, KeyPairIdentifier, PrivateKeyHandle, PublicKeyBytes, PublicKeyHandle, Signature,
};

pub use presence::{AlwaysDeny, AutoApprove, PresenceCheck};
pub use software::SoftwareKeystore;

#[cfg(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
))]
pub use secure_enclave::SecureEnclaveKeystore;

// ==================== Keystore Trait ====================

/// Operations a hardware-backed key store must offer.
///
/// Implementations are blocking: `sign` may sit on an interactive presence
/// prompt, so callers run it off the async executor.
pub trait Keystore: Send + Sync {
    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;

    /// Check if the backing store can be used on this host
    fn is_available(&self) -> bool;

    /// Create a key pair under `identifier`. Any existing pair is replaced.
    fn generate_key_pair(&self, identifier: &KeyPairIdentifier, policy: &AccessPolicy)
    -> Result<()>;

    /// Find the public key stored under `label`
    fn find_public_key(&self, label: &str) -> Result<Option<PublicKeyHandle>>;

    /// Find the private key stored under `label`
    fn find_private_key(&self, label: &str) -> Result<Option<PrivateKeyHandle>>;

    /// Export the encoded public key for a handle
    fn export_public_key(&self, handle: &PublicKeyHandle) -> Result<PublicKeyBytes>;

    /// Run the presence check the private key's policy requires, without signing.
    fn authorize(&self, handle: &PrivateKeyHandle, prompt: &str) -> Result<()>;

    /// Sign `data` with the private key. Presence is checked here, per call.
    fn sign(&self, handle: &PrivateKeyHandle, data: &[u8], prompt: &str) -> Result<Signature>;

    /// ECIES-encrypt `plaintext` to the public key. Never prompts.
    fn encrypt(&self, handle: &PublicKeyHandle, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt an ECIES message with the private key. Presence is checked per call.
    fn decrypt(&self, handle: &PrivateKeyHandle, ciphertext: &[u8], prompt: &str)
    -> Result<Vec<u8>>;

    /// Remove the public key. Absent keys are not an error.
    fn delete_public_key(&self, label: &str) -> Result<()>;

    /// Remove the private key. Absent keys are not an error.
    fn delete_private_key(&self, label: &str) -> Result<()>;
}

impl<K: Keystore + ?Sized> Keystore for Arc<K> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn generate_key_pair(
        &self,
        identifier: &KeyPairIdentifier,
        policy: &AccessPolicy,
    ) -> Result<()> {
        (**self).generate_key_pair(identifier, policy)
    }

    fn find_public_key(&self, label: &str) -> Result<Option<PublicKeyHandle>> {
        (**self).find_public_key(label)
    }

    fn find_private_key(&self, label: &str) -> Result<Option<PrivateKeyHandle>> {
        (**self).find_private_key(label)
    }

    fn export_public_key(&self, handle: &PublicKeyHandle) -> Result<PublicKeyBytes> {
        (**self).export_public_key(handle)
    }

    fn authorize(&self, handle: &PrivateKeyHandle, prompt: &str) -> Result<()> {
        (**self).authorize(handle, prompt)
    }

    fn sign(&self, handle: &PrivateKeyHandle, data: &[u8], prompt: &str) -> Result<Signature> {
        (**self).sign(handle, data, prompt)
    }

    fn encrypt(&self, handle: &PublicKeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
        (**self).encrypt(handle, plaintext)
    }

    fn decrypt(
        &self,
        handle: &PrivateKeyHandle,
        ciphertext: &[u8],
        prompt: &str,
    ) -> Result<Vec<u8>> {
        (**self).decrypt(handle, ciphertext, prompt)
    }

    fn delete_public_key(&self, label: &str) -> Result<()> {
        (**self).delete_public_key(label)
    }

    fn delete_private_key(&self, label: &str) -> Result<()> {
        (**self).delete_private_key(label)
    }
}

// ==================== KeystoreConfig Trait ====================

/// Configuration that knows how to open a keystore.
pub trait KeystoreConfig: Send + Sync {
    /// The keystore type this config creates.
    type Keystore: Keystore + 'static;

    /// Opens (or creates) the keystore described by this configuration.
    fn open_keystore(&self) -> Result<Self::Keystore>;
}

/// Software keystore configuration - in memory, or persisted under `key_dir`.
#[derive(Clone)]
pub struct SoftwareKeystoreConfig {
    pub key_dir: Option<PathBuf>,
    pub presence: Arc<dyn PresenceCheck>,
}

impl SoftwareKeystoreConfig {
    pub fn in_memory() -> Self {
        Self {
            key_dir: None,
            presence: Arc::new(AutoApprove),
        }
    }

    pub fn persistent(key_dir: PathBuf) -> Self {
        Self {
            key_dir: Some(key_dir),
            presence: Arc::new(AutoApprove),
        }
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceCheck>) -> Self {
        self.presence = presence;
        self
    }
}

impl std::fmt::Debug for SoftwareKeystoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKeystoreConfig")
            .field("key_dir", &self.key_dir)
            .finish_non_exhaustive()
    }
}

impl KeystoreConfig for SoftwareKeystoreConfig {
    type Keystore = SoftwareKeystore;

    fn open_keystore(&self) -> Result<Self::Keystore> {
        match &self.key_dir {
            Some(dir) => SoftwareKeystore::open_dir(dir, Arc::clone(&self.presence)),
            None => Ok(SoftwareKeystore::with_presence(Arc::clone(&self.presence))),
        }
    }
}

/// Hardware keystore configuration - keys in the Secure Enclave.
#[cfg(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
))]
#[derive(Debug, Clone, Default)]
pub struct SecureEnclaveKeystoreConfig;

#[cfg(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
))]
impl KeystoreConfig for SecureEnclaveKeystoreConfig {
    type Keystore = SecureEnclaveKeystore;

    fn open_keystore(&self) -> Result<Self::Keystore> {
        SecureEnclaveKeystore::new().ok_or_else(|| {
            crate::error::KeygateError::CapabilityUnavailable(
                "Secure Enclave not available".into(),
            )
        })
    }
}

//! KeyManager - façade over a presence-gated keystore
//!
//! Every operation resolves the configured `KeyPairIdentifier` against the
//! keystore on each call; nothing about the keys is cached here. Synchronous
//! operations come in two forms: `try_*` returning `Result`, and a plain form
//! that reports failure as `false`/`None` after logging it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ExistingKeyPolicy, KeyManagerConfig};
use crate::error::{KeygateError, Result};
use crate::keystore::{Keystore, KeystoreConfig};
use crate::types::{
    KeyPairIdentifier, PrivateKeyHandle, PublicKeyBytes, PublicKeyHandle, Signature,
    SignatureResult,
};

#[derive(Clone)]
pub struct KeyManager {
    keystore: Arc<dyn Keystore>,
    config: KeyManagerConfig,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("keystore", &self.keystore.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    // ==================== Constructors ====================

    pub fn new(keystore: Arc<dyn Keystore>, config: KeyManagerConfig) -> Self {
        Self {
            keystore,
            config,
            runtime: None,
        }
    }

    /// Opens the keystore described by `keystore_config` and wraps it.
    pub fn open<C: KeystoreConfig>(keystore_config: &C, config: KeyManagerConfig) -> Result<Self> {
        let keystore = keystore_config.open_keystore()?;
        if !keystore.is_available() {
            return Err(KeygateError::CapabilityUnavailable(format!(
                "{} keystore not available",
                keystore.name()
            )));
        }
        Ok(Self::new(Arc::new(keystore), config))
    }

    /// Pins signing work to `runtime` instead of the ambient tokio runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// A manager over the same keystore and runtime with a different config.
    pub fn with_config(&self, config: KeyManagerConfig) -> Self {
        Self {
            keystore: Arc::clone(&self.keystore),
            config,
            runtime: self.runtime.clone(),
        }
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    pub fn identifier(&self) -> &KeyPairIdentifier {
        &self.config.identifier
    }

    pub fn keystore_name(&self) -> &'static str {
        self.keystore.name()
    }

    // ==================== Generation ====================

    pub fn try_generate_key_pair(&self) -> Result<()> {
        if !self.keystore.is_available() {
            return Err(KeygateError::CapabilityUnavailable(format!(
                "{} keystore not available",
                self.keystore.name()
            )));
        }

        let identifier = &self.config.identifier;
        if self.config.on_existing == ExistingKeyPolicy::Fail && self.any_half_present()? {
            return Err(KeygateError::KeyExists(identifier.to_string()));
        }

        self.keystore
            .generate_key_pair(identifier, &self.config.access)?;
        info!(
            %identifier,
            keystore = self.keystore.name(),
            user_presence = self.config.access.user_presence,
            "Generated key pair"
        );
        Ok(())
    }

    pub fn generate_key_pair(&self) -> bool {
        report("generate_key_pair", self.try_generate_key_pair()).is_some()
    }

    /// Returns the public key, generating a pair first when either half is missing.
    pub fn ensure_key_pair(&self) -> Result<PublicKeyBytes> {
        let identifier = &self.config.identifier;
        let public = self.keystore.find_public_key(identifier.public_tag())?;
        let private = self.keystore.find_private_key(identifier.private_tag())?;

        if let (Some(public), Some(_)) = (public, private) {
            return self.keystore.export_public_key(&public);
        }

        debug!(%identifier, "Key pair incomplete, generating");
        self.keystore
            .generate_key_pair(identifier, &self.config.access)?;
        let public = self
            .keystore
            .find_public_key(identifier.public_tag())?
            .ok_or_else(|| KeygateError::KeyNotFound(identifier.public_tag().to_string()))?;
        self.keystore.export_public_key(&public)
    }

    fn any_half_present(&self) -> Result<bool> {
        Ok(self.try_public_key_exists()? || self.try_private_key_exists()?)
    }

    // ==================== Queries ====================

    pub fn try_public_key_exists(&self) -> Result<bool> {
        Ok(self.try_lookup_public_key_handle()?.is_some())
    }

    pub fn public_key_exists(&self) -> bool {
        report("public_key_exists", self.try_public_key_exists()).unwrap_or(false)
    }

    /// Whether the private key exists. Unlike a handle lookup this never prompts.
    pub fn try_private_key_exists(&self) -> Result<bool> {
        Ok(self
            .keystore
            .find_private_key(self.config.identifier.private_tag())?
            .is_some())
    }

    pub fn private_key_exists(&self) -> bool {
        report("private_key_exists", self.try_private_key_exists()).unwrap_or(false)
    }

    pub fn try_lookup_public_key_handle(&self) -> Result<Option<PublicKeyHandle>> {
        self.keystore
            .find_public_key(self.config.identifier.public_tag())
    }

    pub fn lookup_public_key_handle(&self) -> Option<PublicKeyHandle> {
        report("lookup_public_key_handle", self.try_lookup_public_key_handle()).flatten()
    }

    /// Finds the private key and passes its presence gate.
    ///
    /// Blocks for as long as the presence check takes. A denied check is an
    /// `AuthenticationDenied` error. The handle only names the key; each
    /// `sign` is gated again.
    pub fn try_lookup_private_key_handle(&self) -> Result<Option<PrivateKeyHandle>> {
        let Some(handle) = self
            .keystore
            .find_private_key(self.config.identifier.private_tag())?
        else {
            return Ok(None);
        };
        self.keystore
            .authorize(&handle, &self.config.operation_prompt)?;
        Ok(Some(handle))
    }

    /// `None` when the key is absent, the presence check is denied, or the keystore fails.
    pub fn lookup_private_key_handle(&self) -> Option<PrivateKeyHandle> {
        report(
            "lookup_private_key_handle",
            self.try_lookup_private_key_handle(),
        )
        .flatten()
    }

    pub fn try_export_public_key_bytes(&self) -> Result<Option<PublicKeyBytes>> {
        match self.try_lookup_public_key_handle()? {
            Some(handle) => self.keystore.export_public_key(&handle).map(Some),
            None => Ok(None),
        }
    }

    pub fn export_public_key_bytes(&self) -> Option<PublicKeyBytes> {
        report(
            "export_public_key_bytes",
            self.try_export_public_key_bytes(),
        )
        .flatten()
    }

    pub fn public_key_hex(&self) -> Result<Option<String>> {
        Ok(self.try_export_public_key_bytes()?.map(|k| k.to_hex()))
    }

    pub fn public_key_pem(&self) -> Result<Option<String>> {
        self.try_export_public_key_bytes()?
            .map(|k| k.to_pem())
            .transpose()
    }

    // ==================== Deletion ====================

    pub fn try_delete_public_key(&self) -> Result<()> {
        let label = self.config.identifier.public_tag();
        self.keystore.delete_public_key(label)?;
        info!(label, "Deleted public key");
        Ok(())
    }

    pub fn delete_public_key(&self) -> bool {
        report("delete_public_key", self.try_delete_public_key()).is_some()
    }

    pub fn try_delete_private_key(&self) -> Result<()> {
        let label = self.config.identifier.private_tag();
        self.keystore.delete_private_key(label)?;
        info!(label, "Deleted private key");
        Ok(())
    }

    pub fn delete_private_key(&self) -> bool {
        report("delete_private_key", self.try_delete_private_key()).is_some()
    }

    /// Deletes the public then the private key. Both are attempted; the first failure wins.
    pub fn delete_key_pair(&self) -> Result<()> {
        let public = self.try_delete_public_key();
        let private = self.try_delete_private_key();
        public.and(private)
    }

    // ==================== Signing ====================

    /// Starts signing `data` with the private key and returns immediately.
    ///
    /// The keystore call, including any presence prompt, runs on the
    /// runtime's blocking pool. The returned future resolves exactly once.
    pub fn sign(&self, data: impl Into<Vec<u8>>) -> SignRequest {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(e) => return KeyRequest::ready(Err(e)),
        };

        let data = data.into();
        let keystore = Arc::clone(&self.keystore);
        let label = self.config.identifier.private_tag().to_string();
        let prompt = self.config.operation_prompt.clone();

        debug!(label = %label, len = data.len(), "Signing request issued");
        let task = runtime.spawn_blocking(move || -> SignatureResult {
            let handle = keystore
                .find_private_key(&label)?
                .ok_or_else(|| KeygateError::KeyNotFound(label.clone()))?;
            let result = keystore.sign(&handle, &data, &prompt);
            if let Err(e) = &result {
                debug!(label = %label, error = %e, "Signing request failed");
            }
            result
        });

        KeyRequest::pending(task)
    }

    /// Callback form of [`KeyManager::sign`]. `completion` runs exactly once.
    ///
    /// Without a runtime the completion runs immediately on the calling
    /// thread with a `CapabilityUnavailable` error.
    pub fn sign_with_completion<F>(&self, data: impl Into<Vec<u8>>, completion: F)
    where
        F: FnOnce(SignatureResult) + Send + 'static,
    {
        match self.runtime() {
            Ok(runtime) => {
                let request = self.sign(data);
                runtime.spawn(async move {
                    completion(request.await);
                });
            }
            Err(e) => completion(Err(e)),
        }
    }

    /// Verifies `signature` over `data` against the stored public key.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<()> {
        let public = self.try_export_public_key_bytes()?.ok_or_else(|| {
            KeygateError::KeyNotFound(self.config.identifier.public_tag().to_string())
        })?;
        public.verify(data, signature)
    }

    // ==================== Encryption ====================

    /// ECIES-encrypts `plaintext` to the stored public key. Never prompts.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let identifier = &self.config.identifier;
        let handle = self
            .try_lookup_public_key_handle()?
            .ok_or_else(|| KeygateError::KeyNotFound(identifier.public_tag().to_string()))?;
        let ciphertext = self.keystore.encrypt(&handle, plaintext)?;
        debug!(%identifier, len = plaintext.len(), "Encrypted to public key");
        Ok(ciphertext)
    }

    /// Starts decrypting `ciphertext` with the private key.
    ///
    /// Runs like [`KeyManager::sign`]: the presence check happens on the
    /// blocking pool and the returned future resolves exactly once.
    pub fn decrypt(&self, ciphertext: impl Into<Vec<u8>>) -> DecryptRequest {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(e) => return KeyRequest::ready(Err(e)),
        };

        let ciphertext = ciphertext.into();
        let keystore = Arc::clone(&self.keystore);
        let label = self.config.identifier.private_tag().to_string();
        let prompt = self.config.operation_prompt.clone();

        debug!(label = %label, len = ciphertext.len(), "Decryption request issued");
        let task = runtime.spawn_blocking(move || -> Result<Vec<u8>> {
            let handle = keystore
                .find_private_key(&label)?
                .ok_or_else(|| KeygateError::KeyNotFound(label.clone()))?;
            let result = keystore.decrypt(&handle, &ciphertext, &prompt);
            if let Err(e) = &result {
                debug!(label = %label, error = %e, "Decryption request failed");
            }
            result
        });

        KeyRequest::pending(task)
    }

    /// Callback form of [`KeyManager::decrypt`]. `completion` runs exactly once.
    pub fn decrypt_with_completion<F>(&self, ciphertext: impl Into<Vec<u8>>, completion: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        match self.runtime() {
            Ok(runtime) => {
                let request = self.decrypt(ciphertext);
                runtime.spawn(async move {
                    completion(request.await);
                });
            }
            Err(e) => completion(Err(e)),
        }
    }

    fn runtime(&self) -> Result<Handle> {
        if let Some(runtime) = &self.runtime {
            return Ok(runtime.clone());
        }
        Handle::try_current().map_err(|e| {
            KeygateError::CapabilityUnavailable(format!("No async runtime for key operations: {}", e))
        })
    }
}

/// Logs a swallowed error and converts to `Option`.
fn report<T>(operation: &'static str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation, kind = ?e.kind(), error = %e, "Key operation failed");
            None
        }
    }
}

// ==================== KeyRequest ====================

/// In-flight private-key operation returned by [`KeyManager::sign`] and
/// [`KeyManager::decrypt`].
///
/// Dropping it detaches the keystore call; no result is fabricated.
#[must_use = "a key request does nothing useful unless awaited"]
pub struct KeyRequest<T> {
    state: RequestState<T>,
}

pub type SignRequest = KeyRequest<Signature>;
pub type DecryptRequest = KeyRequest<Vec<u8>>;

enum RequestState<T> {
    Pending(JoinHandle<Result<T>>),
    Ready(Option<Result<T>>),
}

impl<T> KeyRequest<T> {
    fn pending(task: JoinHandle<Result<T>>) -> Self {
        Self {
            state: RequestState::Pending(task),
        }
    }

    fn ready(result: Result<T>) -> Self {
        Self {
            state: RequestState::Ready(Some(result)),
        }
    }
}

// Nothing inside is ever pinned
impl<T> Unpin for KeyRequest<T> {}

impl<T> Future for KeyRequest<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match &mut self.state {
            RequestState::Pending(task) => match Pin::new(task).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(e)) => Err(KeygateError::KeystoreError(format!(
                    "Keystore task failed: {}",
                    e
                ))),
            },
            RequestState::Ready(result) => result.take().unwrap_or_else(|| {
                Err(KeygateError::KeystoreError(
                    "Key request polled after completion".into(),
                ))
            }),
        };
        self.state = RequestState::Ready(None);
        Poll::Ready(result)
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::keystore::{AlwaysDeny, SoftwareKeystore, SoftwareKeystoreConfig};
    use crate::types::AccessPolicy;
    use std::sync::Mutex;

    fn manager() -> KeyManager {
        KeyManager::new(
            Arc::new(SoftwareKeystore::new()),
            KeyManagerConfig::for_namespace("com.example.manager"),
        )
    }

    #[test]
    fn test_generate_then_lookup() {
        let manager = manager();
        assert!(!manager.public_key_exists());
        assert!(manager.lookup_private_key_handle().is_none());

        assert!(manager.generate_key_pair());
        assert!(manager.public_key_exists());
        assert!(manager.lookup_public_key_handle().is_some());
        assert_eq!(
            manager.lookup_private_key_handle().unwrap().label(),
            "com.example.manager.private"
        );
    }

    #[test]
    fn test_fail_policy_refuses_existing_pair() {
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::new()),
            KeyManagerConfig::for_namespace("com.example.fail")
                .with_existing_policy(ExistingKeyPolicy::Fail),
        );
        assert!(manager.generate_key_pair());
        let original = manager.export_public_key_bytes().unwrap();

        let err = manager.try_generate_key_pair().unwrap_err();
        assert!(matches!(err, KeygateError::KeyExists(_)));
        assert!(!manager.generate_key_pair());
        assert_eq!(manager.export_public_key_bytes().unwrap(), original);
    }

    #[test]
    fn test_fail_policy_also_sees_orphaned_private_key() {
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::new()),
            KeyManagerConfig::for_namespace("com.example.orphan")
                .with_existing_policy(ExistingKeyPolicy::Fail),
        );
        assert!(manager.generate_key_pair());
        assert!(manager.delete_public_key());
        assert!(!manager.generate_key_pair());
    }

    #[test]
    fn test_with_config_shares_keystore() {
        let manager = manager();
        assert!(manager.generate_key_pair());

        let strict = manager.with_config(
            manager
                .config()
                .clone()
                .with_existing_policy(ExistingKeyPolicy::Fail),
        );
        assert!(strict.public_key_exists());
        assert!(!strict.generate_key_pair());
        assert_eq!(manager.config().on_existing, ExistingKeyPolicy::Replace);
    }

    #[test]
    fn test_replace_policy_rotates_key() {
        let manager = manager();
        assert!(manager.generate_key_pair());
        let first = manager.export_public_key_bytes().unwrap();
        assert!(manager.generate_key_pair());
        let second = manager.export_public_key_bytes().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_open_with_keystore_config() {
        let manager = KeyManager::open(
            &SoftwareKeystoreConfig::in_memory(),
            KeyManagerConfig::for_namespace("com.example.open"),
        )
        .unwrap();
        assert_eq!(manager.keystore_name(), "software");
    }

    #[test]
    fn test_ensure_key_pair_is_stable() {
        let manager = manager();
        let first = manager.ensure_key_pair().unwrap();
        let second = manager.ensure_key_pair().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ensure_key_pair_repairs_half_pair() {
        let manager = manager();
        let first = manager.ensure_key_pair().unwrap();
        assert!(manager.delete_private_key());
        let second = manager.ensure_key_pair().unwrap();
        assert_ne!(first, second);
        assert!(manager.lookup_private_key_handle().is_some());
    }

    #[test]
    fn test_delete_key_pair() {
        let manager = manager();
        assert!(manager.generate_key_pair());
        manager.delete_key_pair().unwrap();
        assert!(!manager.public_key_exists());
        assert!(manager.lookup_private_key_handle().is_none());
        manager.delete_key_pair().unwrap();
    }

    #[test]
    fn test_public_key_encodings() {
        let manager = manager();
        assert_eq!(manager.public_key_hex().unwrap(), None);
        assert_eq!(manager.public_key_pem().unwrap(), None);

        assert!(manager.generate_key_pair());
        let hex_str = manager.public_key_hex().unwrap().unwrap();
        assert_eq!(hex_str.len(), 130);
        assert!(hex_str.starts_with("04"));
        assert!(
            manager
                .public_key_pem()
                .unwrap()
                .unwrap()
                .contains("BEGIN PUBLIC KEY")
        );
    }

    #[test]
    fn test_sign_without_runtime_reports_unavailable() {
        let manager = manager();
        assert!(manager.generate_key_pair());

        let (tx, rx) = std::sync::mpsc::channel();
        manager.sign_with_completion(b"data".to_vec(), move |result| {
            tx.send(result).unwrap();
        });
        let result = rx.recv().unwrap();
        assert_eq!(
            result.unwrap_err().kind(),
            ErrorKind::CapabilityUnavailable
        );
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let manager = manager();
        assert!(manager.generate_key_pair());

        let signature = manager.sign(b"hello".to_vec()).await.unwrap();
        manager.verify(b"hello", &signature).unwrap();
        assert!(manager.verify(b"other", &signature).is_err());
    }

    #[tokio::test]
    async fn test_sign_without_key_is_not_found() {
        let manager = manager();
        let err = manager.sign(b"hello".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_verify_without_public_key_is_not_found() {
        let manager = manager();
        assert!(manager.generate_key_pair());
        let signature = manager.sign(b"hello".to_vec()).await.unwrap();
        assert!(manager.delete_public_key());
        assert!(manager.verify(b"hello", &signature).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_denied_presence_is_authentication_denied() {
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(AlwaysDeny))),
            KeyManagerConfig::for_namespace("com.example.denied"),
        );
        assert!(manager.generate_key_pair());
        let err = manager.sign(b"hello".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationDenied);
    }

    #[tokio::test]
    async fn test_prompt_reaches_presence_check() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let check = move |prompt: &str| -> Result<()> {
            recorder.lock().unwrap().push(prompt.to_string());
            Ok(())
        };
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(check))),
            KeyManagerConfig::for_namespace("com.example.prompt").with_prompt("Approve login"),
        );
        assert!(manager.generate_key_pair());
        manager.sign(b"one".to_vec()).await.unwrap();
        manager.sign(b"two".to_vec()).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Approve login".to_string(), "Approve login".to_string()]
        );
    }

    #[test]
    fn test_private_key_lookup_is_presence_gated() {
        let checks = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&checks);
        let check = move |_prompt: &str| -> Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        };
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(check))),
            KeyManagerConfig::for_namespace("com.example.lookup"),
        );
        assert!(manager.generate_key_pair());
        assert_eq!(*checks.lock().unwrap(), 0);

        assert!(manager.lookup_private_key_handle().is_some());
        assert!(manager.lookup_private_key_handle().is_some());
        assert_eq!(*checks.lock().unwrap(), 2);

        // Existence queries never prompt
        assert!(manager.private_key_exists());
        assert!(manager.public_key_exists());
        assert_eq!(*checks.lock().unwrap(), 2);
    }

    #[test]
    fn test_denied_lookup_hides_handle() {
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(AlwaysDeny))),
            KeyManagerConfig::for_namespace("com.example.lookup-denied"),
        );
        assert!(manager.generate_key_pair());
        let err = manager.try_lookup_private_key_handle().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationDenied);
        assert!(manager.lookup_private_key_handle().is_none());
        assert!(manager.private_key_exists());
    }

    #[tokio::test]
    async fn test_ungated_policy_skips_presence() {
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(AlwaysDeny))),
            KeyManagerConfig::for_namespace("com.example.ungated")
                .with_access(AccessPolicy::ungated()),
        );
        assert!(manager.generate_key_pair());
        assert!(manager.lookup_private_key_handle().is_some());
        assert!(manager.sign(b"hello".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sign_returns_before_presence_resolves() {
        let (approve_tx, approve_rx) = std::sync::mpsc::channel::<bool>();
        let approve_rx = Mutex::new(approve_rx);
        let check = move |_prompt: &str| -> Result<()> {
            let approved = approve_rx.lock().unwrap().recv().unwrap_or(false);
            if approved {
                Ok(())
            } else {
                Err(KeygateError::AuthenticationDenied("declined".into()))
            }
        };
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(check))),
            KeyManagerConfig::for_namespace("com.example.pending"),
        );
        assert!(manager.generate_key_pair());

        // The presence check is still waiting when sign() hands back the request
        let request = manager.sign(b"hello".to_vec());
        approve_tx.send(true).unwrap();
        let signature = request.await.unwrap();
        manager.verify(b"hello", &signature).unwrap();
    }

    #[tokio::test]
    async fn test_sign_with_completion_delivers_once() {
        let manager = manager();
        assert!(manager.generate_key_pair());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.sign_with_completion(b"hello".to_vec(), move |result| {
            tx.send(result).unwrap();
        });

        let signature = rx.recv().await.unwrap().unwrap();
        manager.verify(b"hello", &signature).unwrap();
        // Sender was consumed by the single completion call
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_explicit_runtime_handle() {
        let manager = manager().with_runtime(Handle::current());
        assert!(manager.generate_key_pair());
        assert!(manager.sign(b"hello".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_round_trip() {
        let manager = manager();
        assert!(manager.generate_key_pair());

        let ciphertext = manager.encrypt(b"session token").unwrap();
        assert_ne!(&ciphertext[..], b"session token");
        let plaintext = manager.decrypt(ciphertext).await.unwrap();
        assert_eq!(plaintext, b"session token");
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_without_keys_is_not_found() {
        let manager = manager();
        assert_eq!(
            manager.encrypt(b"data").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        assert!(manager.generate_key_pair());
        let ciphertext = manager.encrypt(b"data").unwrap();
        assert!(manager.delete_private_key());
        let err = manager.decrypt(ciphertext).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_denied_presence_blocks_decrypt() {
        let manager = KeyManager::new(
            Arc::new(SoftwareKeystore::with_presence(Arc::new(AlwaysDeny))),
            KeyManagerConfig::for_namespace("com.example.decrypt-denied"),
        );
        assert!(manager.generate_key_pair());
        // Encryption only needs the public key
        let ciphertext = manager.encrypt(b"secret").unwrap();
        let err = manager.decrypt(ciphertext).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationDenied);
    }

    #[test]
    fn test_decrypt_without_runtime_reports_unavailable() {
        let manager = manager();
        assert!(manager.generate_key_pair());
        let ciphertext = manager.encrypt(b"data").unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        // Polled on a runtime, but the request was created without one
        let request = manager.decrypt(ciphertext);
        let err = runtime.block_on(request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityUnavailable);
    }

    #[tokio::test]
    async fn test_decrypt_with_completion_delivers_plaintext() {
        let manager = manager();
        assert!(manager.generate_key_pair());
        let ciphertext = manager.encrypt(b"callback").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.decrypt_with_completion(ciphertext, move |result| {
            tx.send(result).unwrap();
        });
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"callback");
        assert!(rx.recv().await.is_none());
    }

    /// Delegates to a software keystore but reports itself unavailable.
    struct UnavailableKeystore(Arc<SoftwareKeystore>);

    impl Keystore for UnavailableKeystore {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        fn is_available(&self) -> bool {
            false
        }

        fn generate_key_pair(
            &self,
            identifier: &KeyPairIdentifier,
            policy: &AccessPolicy,
        ) -> Result<()> {
            self.0.generate_key_pair(identifier, policy)
        }

        fn find_public_key(&self, label: &str) -> Result<Option<PublicKeyHandle>> {
            self.0.find_public_key(label)
        }

        fn find_private_key(&self, label: &str) -> Result<Option<PrivateKeyHandle>> {
            self.0.find_private_key(label)
        }

        fn export_public_key(&self, handle: &PublicKeyHandle) -> Result<PublicKeyBytes> {
            self.0.export_public_key(handle)
        }

        fn authorize(&self, handle: &PrivateKeyHandle, prompt: &str) -> Result<()> {
            self.0.authorize(handle, prompt)
        }

        fn sign(&self, handle: &PrivateKeyHandle, data: &[u8], prompt: &str) -> Result<Signature> {
            self.0.sign(handle, data, prompt)
        }

        fn encrypt(&self, handle: &PublicKeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
            self.0.encrypt(handle, plaintext)
        }

        fn decrypt(
            &self,
            handle: &PrivateKeyHandle,
            ciphertext: &[u8],
            prompt: &str,
        ) -> Result<Vec<u8>> {
            self.0.decrypt(handle, ciphertext, prompt)
        }

        fn delete_public_key(&self, label: &str) -> Result<()> {
            self.0.delete_public_key(label)
        }

        fn delete_private_key(&self, label: &str) -> Result<()> {
            self.0.delete_private_key(label)
        }
    }

    struct UnavailableKeystoreConfig(Arc<SoftwareKeystore>);

    impl KeystoreConfig for UnavailableKeystoreConfig {
        type Keystore = UnavailableKeystore;

        fn open_keystore(&self) -> Result<Self::Keystore> {
            Ok(UnavailableKeystore(Arc::clone(&self.0)))
        }
    }

    #[test]
    fn test_unavailable_keystore_is_refused() {
        let inner = Arc::new(SoftwareKeystore::new());
        let config = KeyManagerConfig::for_namespace("com.example.unavailable");
        let identifier = config.identifier.clone();

        let err = KeyManager::open(&UnavailableKeystoreConfig(Arc::clone(&inner)), config.clone())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityUnavailable);

        // A manager built directly still refuses to generate
        let manager = KeyManager::new(
            Arc::new(UnavailableKeystore(Arc::clone(&inner))),
            config,
        );
        assert_eq!(
            manager.try_generate_key_pair().unwrap_err().kind(),
            ErrorKind::CapabilityUnavailable
        );
        assert!(!manager.generate_key_pair());
        assert!(inner.find_public_key(identifier.public_tag()).unwrap().is_none());
        assert!(inner.find_private_key(identifier.private_tag()).unwrap().is_none());
        assert!(!manager.public_key_exists());
    }

    #[test]
    fn test_debug_omits_key_material() {
        let manager = manager();
        let debug = format!("{:?}", manager);
        assert!(debug.contains("software"));
        assert!(debug.contains("com.example.manager.private"));
    }
}

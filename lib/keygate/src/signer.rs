//! Async signing abstraction for code that should not depend on KeyManager directly

use async_trait::async_trait;

use crate::error::{KeygateError, Result};
use crate::manager::KeyManager;
use crate::types::{PublicKeyBytes, Signature};

/// Something that can sign on behalf of a single key pair.
#[async_trait]
pub trait KeySigner: Send + Sync {
    /// Public half of the signing key.
    async fn public_key(&self) -> Result<PublicKeyBytes>;

    /// Signs `data`. May wait on user interaction.
    async fn sign(&self, data: &[u8]) -> Result<Signature>;
}

#[async_trait]
impl KeySigner for KeyManager {
    async fn public_key(&self) -> Result<PublicKeyBytes> {
        self.try_export_public_key_bytes()?.ok_or_else(|| {
            KeygateError::KeyNotFound(self.identifier().public_tag().to_string())
        })
    }

    async fn sign(&self, data: &[u8]) -> Result<Signature> {
        KeyManager::sign(self, data.to_vec()).await
    }
}

//! Secure Enclave Keystore
//!
//! Keychain-backed P-256 keys generated inside the Secure Enclave. The
//! private key is labelled with the identifier's private tag; the public key
//! is saved as its own keychain item under the public tag so the two can be
//! deleted independently.

use security_framework::access_control::{ProtectionMode, SecAccessControl};
use security_framework::item::{
    AddRef, ItemAddOptions, ItemAddValue, ItemClass, ItemSearchOptions, KeyClass, Location,
    Reference, SearchResult,
};
use security_framework::key::{Algorithm, GenerateKeyOptions, KeyType, SecKey, Token};
use security_framework_sys::access_control::{
    kSecAccessControlPrivateKeyUsage, kSecAccessControlUserPresence,
};
use tracing::debug;

use super::Keystore;
use crate::error::{KeygateError, Result};
use crate::types::{
    AccessPolicy, KeyPairIdentifier, PrivateKeyHandle, PublicKeyBytes, PublicKeyHandle, Signature,
};

const AUTHORIZE_CHALLENGE: &[u8] = b"keygate.authorize";
const AVAILABILITY_CHECK_LABEL: &str = "keygate.availability-check";
const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;
const ERR_SEC_USER_CANCELED: isize = -128;
const ERR_SEC_AUTH_FAILED: isize = -25293;
const ERR_SEC_INTERACTION_NOT_ALLOWED: isize = -25308;

/// Keystore backed by the Secure Enclave
pub struct SecureEnclaveKeystore;

impl SecureEnclaveKeystore {
    pub fn new() -> Option<Self> {
        let keystore = Self;
        if keystore.is_available() {
            Some(keystore)
        } else {
            None
        }
    }

    fn find_key(&self, label: &str, key_class: fn() -> KeyClass) -> Result<Option<SecKey>> {
        let results = ItemSearchOptions::new()
            .class(ItemClass::key())
            .key_class(key_class())
            .label(label)
            .load_refs(true)
            .search();

        match results {
            Ok(items) => {
                for item in items {
                    if let SearchResult::Ref(Reference::Key(key)) = item {
                        return Ok(Some(key));
                    }
                }
                Ok(None)
            }
            Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(e) => Err(KeygateError::KeystoreError(format!(
                "Key search failed: {}",
                e
            ))),
        }
    }

    fn delete_all(&self, label: &str, key_class: fn() -> KeyClass) -> Result<()> {
        while let Some(key) = self.find_key(label, key_class)? {
            key.delete()
                .map_err(|e| KeygateError::KeystoreError(format!("Failed to delete key: {}", e)))?;
        }
        Ok(())
    }

    fn private_key(&self, handle: &PrivateKeyHandle) -> Result<SecKey> {
        self.find_key(handle.label(), KeyClass::private)?
            .ok_or_else(|| KeygateError::KeyNotFound(handle.label().to_string()))
    }

    fn public_key(&self, handle: &PublicKeyHandle) -> Result<SecKey> {
        self.find_key(handle.label(), KeyClass::public)?
            .ok_or_else(|| KeygateError::KeyNotFound(handle.label().to_string()))
    }

    fn access_control(policy: &AccessPolicy) -> Result<SecAccessControl> {
        let protection = protection_mode(policy);
        let mut flags = kSecAccessControlPrivateKeyUsage;
        if policy.user_presence {
            flags |= kSecAccessControlUserPresence;
        }
        SecAccessControl::create_with_protection(Some(protection), flags).map_err(|e| {
            KeygateError::KeystoreError(format!("Could not create access control: {}", e))
        })
    }
}

/// Enclave keys only accept the ThisDeviceOnly accessibility classes, since
/// the key material can never leave the device.
fn protection_mode(policy: &AccessPolicy) -> ProtectionMode {
    if policy.this_device_only {
        ProtectionMode::AccessibleWhenPasscodeSetThisDeviceOnly
    } else {
        debug!("Enclave keys are always device-bound, using AfterFirstUnlockThisDeviceOnly");
        ProtectionMode::AccessibleAfterFirstUnlockThisDeviceOnly
    }
}

/// Map a failed private-key operation to `AuthenticationDenied` when the user
/// (or a locked device) refused it.
fn private_key_error(
    code: isize,
    message: String,
    failure: fn(String) -> KeygateError,
    operation: &str,
) -> KeygateError {
    match code {
        ERR_SEC_USER_CANCELED | ERR_SEC_AUTH_FAILED | ERR_SEC_INTERACTION_NOT_ALLOWED => {
            KeygateError::AuthenticationDenied(message)
        }
        _ => failure(format!("{} failed: {}", operation, message)),
    }
}

impl Keystore for SecureEnclaveKeystore {
    fn name(&self) -> &'static str {
        "secure-enclave"
    }

    fn is_available(&self) -> bool {
        // Simulators have no enclave
        if cfg!(target_abi = "sim") {
            return false;
        }
        // A keychain that cannot be searched (missing entitlement, locked
        // device) cannot hold enclave keys either
        match ItemSearchOptions::new()
            .class(ItemClass::key())
            .label(AVAILABILITY_CHECK_LABEL)
            .search()
        {
            Ok(_) => true,
            Err(e) if e.code() == ERR_SEC_ITEM_NOT_FOUND => true,
            Err(e) => {
                debug!(code = e.code(), "Keychain search failed");
                false
            }
        }
    }

    fn generate_key_pair(
        &self,
        identifier: &KeyPairIdentifier,
        policy: &AccessPolicy,
    ) -> Result<()> {
        self.delete_all(identifier.public_tag(), KeyClass::public)?;
        self.delete_all(identifier.private_tag(), KeyClass::private)?;

        let mut options = GenerateKeyOptions::default();
        options
            .set_key_type(KeyType::ec())
            .set_size_in_bits(256)
            .set_token(Token::SecureEnclave)
            .set_label(identifier.private_tag())
            .set_location(Location::DataProtectionKeychain)
            .set_access_control(Self::access_control(policy)?);

        let private_key = SecKey::generate(options.to_dictionary()).map_err(|e| {
            if e.code() == ERR_SEC_USER_CANCELED {
                KeygateError::AuthenticationDenied(format!("Key generation cancelled: {}", e))
            } else {
                KeygateError::KeystoreError(format!("Failed to generate key: {}", e))
            }
        })?;

        let public_key = private_key
            .public_key()
            .ok_or_else(|| KeygateError::KeystoreError("Failed to get public key".into()))?;

        ItemAddOptions::new(ItemAddValue::Ref(AddRef::Key(public_key)))
            .set_label(identifier.public_tag())
            .set_location(Location::DataProtectionKeychain)
            .add()
            .map_err(|e| KeygateError::KeystoreError(format!("Could not save public key: {}", e)))?;

        debug!(%identifier, "Generated Secure Enclave key pair");
        Ok(())
    }

    fn find_public_key(&self, label: &str) -> Result<Option<PublicKeyHandle>> {
        Ok(self
            .find_key(label, KeyClass::public)?
            .map(|_| PublicKeyHandle::new(label)))
    }

    fn find_private_key(&self, label: &str) -> Result<Option<PrivateKeyHandle>> {
        Ok(self
            .find_key(label, KeyClass::private)?
            .map(|_| PrivateKeyHandle::new(label)))
    }

    fn export_public_key(&self, handle: &PublicKeyHandle) -> Result<PublicKeyBytes> {
        let public_key = self.public_key(handle)?;

        let data = public_key
            .external_representation()
            .ok_or_else(|| KeygateError::KeystoreError("Failed to export public key".into()))?;

        PublicKeyBytes::from_sec1(&data.to_vec())
    }

    fn authorize(&self, handle: &PrivateKeyHandle, prompt: &str) -> Result<()> {
        // The enclave only prompts when the key is used, so use it on a throwaway challenge
        self.sign(handle, AUTHORIZE_CHALLENGE, prompt).map(|_| ())
    }

    fn sign(&self, handle: &PrivateKeyHandle, data: &[u8], prompt: &str) -> Result<Signature> {
        let private_key = self.private_key(handle)?;

        // The system supplies the presence prompt text for enclave keys
        debug!(label = handle.label(), prompt, "Requesting enclave signature");

        let der = private_key
            .create_signature(Algorithm::ECDSASignatureMessageX962SHA256, data)
            .map_err(|e| {
                private_key_error(
                    e.code(),
                    e.to_string(),
                    KeygateError::SigningFailed,
                    "create_signature",
                )
            })?;

        Signature::from_der(&der)
    }

    fn encrypt(&self, handle: &PublicKeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
        let public_key = self.public_key(handle)?;
        public_key
            .encrypt_data(Algorithm::ECIESEncryptionStandardX963SHA256AESGCM, plaintext)
            .map_err(|e| KeygateError::EncryptionFailed(format!("encrypt_data failed: {}", e)))
    }

    fn decrypt(
        &self,
        handle: &PrivateKeyHandle,
        ciphertext: &[u8],
        prompt: &str,
    ) -> Result<Vec<u8>> {
        let private_key = self.private_key(handle)?;
        debug!(label = handle.label(), prompt, "Requesting enclave decryption");

        private_key
            .decrypt_data(Algorithm::ECIESEncryptionStandardX963SHA256AESGCM, ciphertext)
            .map_err(|e| {
                private_key_error(
                    e.code(),
                    e.to_string(),
                    KeygateError::DecryptionFailed,
                    "decrypt_data",
                )
            })
    }

    fn delete_public_key(&self, label: &str) -> Result<()> {
        self.delete_all(label, KeyClass::public)
    }

    fn delete_private_key(&self, label: &str) -> Result<()> {
        self.delete_all(label, KeyClass::private)
    }
}

// ==================== Tests ====================

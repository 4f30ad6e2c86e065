//! Keygate Error Types

use thiserror::Error;

/// Coarse classification callers can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No usable hardware-backed keystore (or no runtime to drive it)
    CapabilityUnavailable,
    /// The requested key material does not exist
    NotFound,
    /// The user declined or failed the presence check
    AuthenticationDenied,
    /// Any other keystore or platform failure
    Keystore,
}

#[derive(Error, Debug)]
pub enum KeygateError {
    #[error("Keystore capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Authentication denied: {0}")]
    AuthenticationDenied(String),

    #[error("Keystore error: {0}")]
    KeystoreError(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl KeygateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeygateError::CapabilityUnavailable(_) => ErrorKind::CapabilityUnavailable,
            KeygateError::KeyNotFound(_) => ErrorKind::NotFound,
            KeygateError::AuthenticationDenied(_) => ErrorKind::AuthenticationDenied,
            _ => ErrorKind::Keystore,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<p256::ecdsa::Error> for KeygateError {
    fn from(e: p256::ecdsa::Error) -> Self {
        KeygateError::InvalidSignature(e.to_string())
    }
}

impl From<hex::FromHexError> for KeygateError {
    fn from(e: hex::FromHexError) -> Self {
        KeygateError::StorageError(format!("Invalid hex: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, KeygateError>;

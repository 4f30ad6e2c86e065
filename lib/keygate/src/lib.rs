//! Keygate - presence-gated key management
//!
//! A façade over a hardware-backed keystore (the Secure Enclave on Apple
//! platforms, or a software keystore elsewhere): generate a P-256 key pair
//! whose private half is gated by user presence, look up and delete either
//! half, export the public key, sign asynchronously, and ECIES-encrypt to
//! the key pair.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod config;
mod ecies;
pub mod error;
pub mod keystore;
pub mod manager;
pub mod signer;
pub mod types;

pub use config::{DEFAULT_OPERATION_PROMPT, ExistingKeyPolicy, KeyManagerConfig};
pub use error::{ErrorKind, KeygateError, Result};
pub use keystore::{
    AlwaysDeny, AutoApprove, Keystore, KeystoreConfig, PresenceCheck, SoftwareKeystore,
    SoftwareKeystoreConfig,
};
pub use manager::{DecryptRequest, KeyManager, KeyRequest, SignRequest};
pub use signer::KeySigner;
pub use types::{
    AccessPolicy, KeyPairIdentifier, PrivateKeyHandle, PublicKeyBytes, PublicKeyHandle, Signature,
    SignatureResult,
};

#[cfg(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
))]
pub use keystore::{SecureEnclaveKeystore, SecureEnclaveKeystoreConfig};

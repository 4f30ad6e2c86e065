//! Keygate data model: identifiers, opaque handles, exported keys and signatures

use std::fmt;

use p256::ecdsa::VerifyingKey;
use p256::ecdsa::signature::Verifier;
use p256::pkcs8::{EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KeygateError, Result};

/// Uncompressed SEC1 point length for P-256 (0x04 || x || y)
pub const P256_PUBLIC_KEY_LEN: usize = 65;

/// Fixed-width `r || s` length for P-256 ECDSA
pub const P256_SIGNATURE_LEN: usize = 64;

// ==================== KeyPairIdentifier ====================

/// The pair of labels a key pair lives under in the keystore namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPairIdentifier {
    private_tag: String,
    public_tag: String,
}

impl KeyPairIdentifier {
    pub fn new(private_tag: impl Into<String>, public_tag: impl Into<String>) -> Self {
        Self {
            private_tag: private_tag.into(),
            public_tag: public_tag.into(),
        }
    }

    /// `com.example.app` -> (`com.example.app.private`, `com.example.app.public`)
    pub fn from_namespace(namespace: &str) -> Self {
        Self::new(
            format!("{}.private", namespace),
            format!("{}.public", namespace),
        )
    }

    pub fn private_tag(&self) -> &str {
        &self.private_tag
    }

    pub fn public_tag(&self) -> &str {
        &self.public_tag
    }
}

impl fmt::Display for KeyPairIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.private_tag, self.public_tag)
    }
}

// ==================== Access Policy ====================

/// Constraints attached to the private key at generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    /// Require a presence check (biometric or passcode) on every private-key use
    pub user_presence: bool,
    /// Key never leaves this device through backup or migration
    pub this_device_only: bool,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            user_presence: true,
            this_device_only: true,
        }
    }
}

impl AccessPolicy {
    /// No gate. Only meant for tests and headless tooling.
    pub fn ungated() -> Self {
        Self {
            user_presence: false,
            this_device_only: true,
        }
    }
}

// ==================== Handles ====================

/// Opaque reference to private key material held by a keystore.
///
/// Carries only the lookup label; it can be handed back to the keystore for
/// signing but never yields key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrivateKeyHandle {
    label: String,
}

impl PrivateKeyHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Opaque reference to public key material held by a keystore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyHandle {
    label: String,
}

impl PublicKeyHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

// ==================== PublicKeyBytes ====================

/// Exported P-256 public key as an uncompressed SEC1 point.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyBytes(Vec<u8>);

impl PublicKeyBytes {
    /// Wraps and validates an uncompressed (or compressed) SEC1 point.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_verifying_key(&key))
    }

    /// Accepts hex with embedded whitespace, as pasted from a device log.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let cleaned: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(cleaned)
            .map_err(|e| KeygateError::InvalidPublicKey(format!("Invalid hex: {}", e)))?;
        Self::from_sec1(&bytes)
    }

    pub(crate) fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_encoded_point(false).as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks the bytes decode to a point on P-256.
    pub fn validate(&self) -> Result<()> {
        self.verifying_key().map(|_| ())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// SubjectPublicKeyInfo DER (`id-ecPublicKey`, `prime256v1`).
    pub fn to_spki_der(&self) -> Result<Vec<u8>> {
        let key = p256::PublicKey::from_sec1_bytes(&self.0)
            .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))?;
        let document = key
            .to_public_key_der()
            .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))?;
        Ok(document.as_bytes().to_vec())
    }

    /// `-----BEGIN PUBLIC KEY-----` armoured SPKI.
    pub fn to_pem(&self) -> Result<String> {
        let key = p256::PublicKey::from_sec1_bytes(&self.0)
            .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))?;
        key.to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))
    }

    /// SHA-256 over the SPKI DER, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        let der = self.to_spki_der()?;
        Ok(hex::encode(Sha256::digest(&der)))
    }

    /// ECDSA-P256-SHA256 verification of `data`.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key()?
            .verify(data, &signature.0)
            .map_err(|e| KeygateError::VerificationFailed(e.to_string()))
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.0)
            .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKeyBytes").field(&self.to_hex()).finish()
    }
}

impl AsRef<[u8]> for PublicKeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ==================== Signature ====================

/// ECDSA P-256 signature, normalized to fixed-width `r || s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(p256::ecdsa::Signature);

impl Signature {
    /// Parses an X9.62 DER signature, the form the Secure Enclave returns.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self(p256::ecdsa::Signature::from_der(der)?))
    }

    /// Parses a 64-byte `r || s` signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != P256_SIGNATURE_LEN {
            return Err(KeygateError::InvalidSignature(format!(
                "Unexpected signature length: {} (expected {})",
                bytes.len(),
                P256_SIGNATURE_LEN
            )));
        }
        Ok(Self(p256::ecdsa::Signature::from_slice(bytes)?))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| KeygateError::InvalidSignature(format!("Invalid hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn to_der(&self) -> Vec<u8> {
        self.0.to_der().as_bytes().to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl From<p256::ecdsa::Signature> for Signature {
    fn from(sig: p256::ecdsa::Signature) -> Self {
        Self(sig)
    }
}

/// Outcome of a single signing request.
pub type SignatureResult = Result<Signature>;

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer;
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKey, PublicKeyBytes) {
        let signing_key = SigningKey::random(&mut OsRng);
        let public = PublicKeyBytes::from_verifying_key(signing_key.verifying_key());
        (signing_key, public)
    }

    #[test]
    fn test_identifier_from_namespace() {
        let id = KeyPairIdentifier::from_namespace("com.example.app");
        assert_eq!(id.private_tag(), "com.example.app.private");
        assert_eq!(id.public_tag(), "com.example.app.public");
        assert_eq!(
            id.to_string(),
            "com.example.app.private/com.example.app.public"
        );
    }

    #[test]
    fn test_identifier_serde() {
        let id = KeyPairIdentifier::new("priv", "pub");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"private_tag":"priv","public_tag":"pub"}"#);
    }

    #[test]
    fn test_access_policy_default_requires_presence() {
        let policy = AccessPolicy::default();
        assert!(policy.user_presence);
        assert!(policy.this_device_only);
        assert!(!AccessPolicy::ungated().user_presence);
    }

    #[test]
    fn test_public_key_is_uncompressed_point() {
        let (_, public) = keypair();
        assert_eq!(public.len(), P256_PUBLIC_KEY_LEN);
        assert_eq!(public.as_bytes()[0], 0x04);
        assert!(public.validate().is_ok());
    }

    #[test]
    fn test_public_key_from_hex_with_whitespace() {
        let (_, public) = keypair();
        let hex_str = public.to_hex();
        let spaced: String = hex_str
            .as_bytes()
            .chunks(8)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(PublicKeyBytes::from_hex(&spaced).unwrap(), public);
    }

    #[test]
    fn test_public_key_rejects_off_curve_point() {
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&[0x01; 64]);
        assert!(matches!(
            PublicKeyBytes::from_sec1(&bytes),
            Err(KeygateError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_pem_export() {
        let (_, public) = keypair();
        let pem = public.to_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }

    #[test]
    fn test_spki_der_carries_ec_oids() {
        let (_, public) = keypair();
        let der = public.to_spki_der().unwrap();
        // id-ecPublicKey 1.2.840.10045.2.1
        let ec_public_key = [0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
        // prime256v1 1.2.840.10045.3.1.7
        let prime256v1 = [0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
        assert!(der.windows(ec_public_key.len()).any(|w| w == ec_public_key));
        assert!(der.windows(prime256v1.len()).any(|w| w == prime256v1));
        assert!(der.ends_with(public.as_bytes()));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let (_, public) = keypair();
        let fp = public.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, public.clone().fingerprint().unwrap());
    }

    #[test]
    fn test_signature_der_conversion() {
        let (signing_key, public) = keypair();
        let sig: p256::ecdsa::Signature = signing_key.sign(b"hello");
        let sig = Signature::from(sig);

        let from_der = Signature::from_der(&sig.to_der()).unwrap();
        assert_eq!(from_der, sig);
        assert_eq!(sig.to_bytes().len(), P256_SIGNATURE_LEN);
        assert!(public.verify(b"hello", &from_der).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_message() {
        let (signing_key, public) = keypair();
        let sig = Signature::from(Signer::<p256::ecdsa::Signature>::sign(
            &signing_key,
            b"hello",
        ));
        assert!(matches!(
            public.verify(b"goodbye", &sig),
            Err(KeygateError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_signature_rejects_bad_lengths() {
        assert!(Signature::from_bytes(&[0u8; 63]).is_err());
        assert!(Signature::from_der(&[0x30, 0x00]).is_err());
        assert!(Signature::from_hex("not hex").is_err());
    }
}

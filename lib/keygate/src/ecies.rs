//! ECIES over P-256 in the Secure Enclave's standard X9.63/SHA-256/AES-GCM format
//!
//! Ciphertext layout: `ephemeral public key (65) || AES-GCM ciphertext || tag (16)`.
//! The AES-128 key is the X9.63 SHA-256 KDF of the ECDH shared secret, with
//! the uncompressed ephemeral key as shared info. The 16-byte GCM nonce is all
//! zeros; every message has a fresh ephemeral key, so a key is never reused.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, Nonce};
use p256::ecdh::{EphemeralSecret, diffie_hellman};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{NonZeroScalar, PublicKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{KeygateError, Result};
use crate::types::{P256_PUBLIC_KEY_LEN, PublicKeyBytes};

type Aes128Gcm16 = AesGcm<Aes128, U16>;

const AES_KEY_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Encrypts `plaintext` to `recipient`.
pub(crate) fn encrypt(recipient: &PublicKeyBytes, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = PublicKey::from_sec1_bytes(recipient.as_bytes())
        .map_err(|e| KeygateError::InvalidPublicKey(e.to_string()))?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(&recipient);

    let cipher = cipher(shared.raw_secret_bytes(), ephemeral_point.as_bytes())?;
    let sealed = cipher
        .encrypt(&Nonce::<U16>::default(), plaintext)
        .map_err(|_| KeygateError::EncryptionFailed("AES-GCM seal failed".into()))?;

    let mut output = Vec::with_capacity(P256_PUBLIC_KEY_LEN + sealed.len());
    output.extend_from_slice(ephemeral_point.as_bytes());
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Decrypts a message produced by [`encrypt`] (or the Secure Enclave) with `secret`.
pub(crate) fn decrypt(secret: &NonZeroScalar, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < P256_PUBLIC_KEY_LEN + TAG_LEN {
        return Err(KeygateError::DecryptionFailed(format!(
            "Ciphertext too short: {} bytes",
            ciphertext.len()
        )));
    }

    let (point, sealed) = ciphertext.split_at(P256_PUBLIC_KEY_LEN);
    let ephemeral = PublicKey::from_sec1_bytes(point).map_err(|e| {
        KeygateError::DecryptionFailed(format!("Invalid ephemeral key: {}", e))
    })?;
    let shared = diffie_hellman(secret, ephemeral.as_affine());

    let cipher = cipher(shared.raw_secret_bytes(), point)?;
    cipher
        .decrypt(&Nonce::<U16>::default(), sealed)
        .map_err(|_| KeygateError::DecryptionFailed("Authentication tag mismatch".into()))
}

fn cipher(shared_secret: &[u8], shared_info: &[u8]) -> Result<Aes128Gcm16> {
    let key = x963_kdf(shared_secret, shared_info, AES_KEY_LEN);
    Aes128Gcm16::new_from_slice(&key)
        .map_err(|e| KeygateError::EncryptionFailed(format!("Invalid key length: {}", e)))
}

/// ANSI X9.63 key derivation with SHA-256.
fn x963_kdf(secret: &[u8], shared_info: &[u8], len: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(len + 32);
    let mut counter: u32 = 1;
    while output.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        output.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    output.truncate(len);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::SecretKey;

    fn recipient() -> (SecretKey, PublicKeyBytes) {
        let secret = SecretKey::random(&mut OsRng);
        let public =
            PublicKeyBytes::from_sec1(secret.public_key().to_encoded_point(false).as_bytes())
                .unwrap();
        (secret, public)
    }

    #[test]
    fn test_round_trip() {
        let (secret, public) = recipient();
        let ciphertext = encrypt(&public, b"attack at dawn").unwrap();
        assert_eq!(ciphertext.len(), P256_PUBLIC_KEY_LEN + 14 + TAG_LEN);
        assert_eq!(ciphertext[0], 0x04);

        let plaintext = decrypt(&secret.to_nonzero_scalar(), &ciphertext).unwrap();
        assert_eq!(plaintext, b"attack at dawn");
    }

    #[test]
    fn test_empty_plaintext() {
        let (secret, public) = recipient();
        let ciphertext = encrypt(&public, b"").unwrap();
        assert_eq!(ciphertext.len(), P256_PUBLIC_KEY_LEN + TAG_LEN);
        assert!(decrypt(&secret.to_nonzero_scalar(), &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn test_each_message_uses_fresh_ephemeral_key() {
        let (_, public) = recipient();
        let first = encrypt(&public, b"same").unwrap();
        let second = encrypt(&public, b"same").unwrap();
        assert_ne!(first[..P256_PUBLIC_KEY_LEN], second[..P256_PUBLIC_KEY_LEN]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (secret, public) = recipient();
        let mut ciphertext = encrypt(&public, b"integrity").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        let err = decrypt(&secret.to_nonzero_scalar(), &ciphertext).unwrap_err();
        assert!(matches!(err, KeygateError::DecryptionFailed(_)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (_, public) = recipient();
        let (other, _) = recipient();
        let ciphertext = encrypt(&public, b"not for you").unwrap();
        assert!(decrypt(&other.to_nonzero_scalar(), &ciphertext).is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let (secret, _) = recipient();
        let err = decrypt(&secret.to_nonzero_scalar(), &[0x04; 40]).unwrap_err();
        assert!(matches!(err, KeygateError::DecryptionFailed(_)));
    }

    #[test]
    fn test_kdf_expands_past_one_block() {
        let short = x963_kdf(b"secret", b"info", 16);
        let long = x963_kdf(b"secret", b"info", 48);
        assert_eq!(long.len(), 48);
        assert_eq!(&long[..16], &short[..]);
        assert_ne!(x963_kdf(b"secret", b"other", 16), short);
    }
}

//! AES-256-GCM primitives for the secret vault.
//!
//! Each blob is sealed with a unique random nonce, prepended to the
//! ciphertext and base64-encoded as a single string. The master key
//! must be 32 bytes (256 bits) and is provided from an environment
//! variable at startup.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::BrokerError;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Seals plaintext with AES-256-GCM under a fresh random nonce.
///
/// Returns `base64(nonce || ciphertext)`. Sealing the same plaintext
/// twice yields different blobs, so stored ciphertexts never leak
/// equality.
pub fn seal(plaintext: &[u8], key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Random nonce, never reused
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&blob))
}

/// Opens a blob produced by [`seal`].
///
/// Fails with [`BrokerError::Decryption`] when the blob is malformed or
/// the authentication tag does not verify. Callers treat this as
/// "secret unusable", never as a process-level failure.
pub fn open(blob: &str, key: &[u8]) -> Result<Vec<u8>, BrokerError> {
    if key.len() != KEY_SIZE {
        return Err(BrokerError::Decryption(format!(
            "encryption key must be {} bytes",
            KEY_SIZE
        )));
    }

    let bytes = BASE64
        .decode(blob)
        .map_err(|e| BrokerError::Decryption(format!("invalid base64: {}", e)))?;

    if bytes.len() <= NONCE_SIZE {
        return Err(BrokerError::Decryption(format!(
            "blob too short: {} bytes",
            bytes.len()
        )));
    }

    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BrokerError::Decryption(format!("failed to create cipher: {}", e)))?;

    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| BrokerError::Decryption("authentication tag mismatch".to_string()))
}

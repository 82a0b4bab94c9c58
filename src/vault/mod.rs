//! Encrypted secret vault.
//!
//! Secrets are named bundles of credential fields (a JSON map) owned by
//! one user. Bundles are encrypted as a whole before they touch the
//! database and decrypted on the way out; plaintext values are never
//! persisted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SecretStore                        │
//! │  - user-scoped CRUD                      │
//! │  - ciphertext in, ciphertext out         │
//! └─────────────────────────────────────────┘
//!          ↑                    ↑
//!   (encrypt_bundle)     (decrypt_bundle)
//!          │                    │
//! ┌─────────────────────────────────────────┐
//! │       SecretVault                        │
//! │  - AES-256-GCM, nonce embedded in blob   │
//! │  - sole holder of the master key         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Bundles encrypted at rest with AES-256-GCM (authenticated)
//! - A fresh nonce per encryption, embedded in the blob
//! - Master key held in memory only, loaded from the environment
//! - Decryption failure means "secret unusable", never a crash

use anyhow::{Context, Result};
use serde_json::{Map, Value};

mod encryption;
mod store;

pub use encryption::validate_key;
pub use store::{SecretRecord, SecretStore};

use crate::error::BrokerError;

/// A decrypted secret bundle: named credential fields.
pub type SecretBundle = Map<String, Value>;

/// Reserved bundle key distinguishing user-supplied OAuth application
/// credentials from broker-issued token grants. Their deletion and
/// rotation semantics differ.
pub const KIND_KEY: &str = "kind";
/// Bundle kind for user-supplied OAuth app credentials (the default).
pub const KIND_APP: &str = "app";
/// Bundle kind for token grants issued by the broker.
pub const KIND_TOKEN: &str = "token";

/// Symmetric vault for secret bundles, keyed by the server-wide master
/// key. No other component sees the key.
pub struct SecretVault {
    key: Vec<u8>,
}

impl SecretVault {
    /// Build a vault from the base64-encoded 32-byte master key.
    ///
    /// An invalid key is a startup error; the caller treats it as fatal.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = encryption::validate_key(key_base64).context("Invalid encryption key")?;
        Ok(Self { key })
    }

    /// Encrypt a bundle into a single ciphertext blob.
    pub fn encrypt_bundle(&self, bundle: &SecretBundle) -> Result<String> {
        let plaintext =
            serde_json::to_vec(bundle).context("Failed to serialize secret bundle")?;
        encryption::seal(&plaintext, &self.key)
    }

    /// Decrypt a ciphertext blob back into a bundle.
    pub fn decrypt_bundle(&self, blob: &str) -> Result<SecretBundle, BrokerError> {
        let plaintext = encryption::open(blob, &self.key)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| BrokerError::Decryption(format!("bundle is not a JSON map: {}", e)))
    }

    /// Seal arbitrary bytes under the vault key. Used for the OAuth
    /// state parameter, which needs the same tamper evidence as a
    /// stored secret.
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<String> {
        encryption::seal(plaintext, &self.key)
    }

    /// Open bytes sealed with [`seal_bytes`](Self::seal_bytes).
    pub fn open_bytes(&self, blob: &str) -> Result<Vec<u8>, BrokerError> {
        encryption::open(blob, &self.key)
    }
}

/// Whether a decrypted bundle is a broker-issued token grant.
pub fn is_token_bundle(bundle: &SecretBundle) -> bool {
    bundle
        .get(KIND_KEY)
        .and_then(|v| v.as_str())
        .map(|kind| kind == KIND_TOKEN)
        .unwrap_or(false)
}

/// Fetch a non-empty string field from a bundle.
pub fn bundle_str<'a>(bundle: &'a SecretBundle, key: &str) -> Option<&'a str> {
    bundle
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::json;

    fn test_vault() -> SecretVault {
        SecretVault::new(&BASE64.encode([7u8; 32])).unwrap()
    }

    fn sample_bundle() -> SecretBundle {
        let mut bundle = SecretBundle::new();
        bundle.insert("client_id".to_string(), json!("abc123"));
        bundle.insert("client_secret".to_string(), json!("s3cret"));
        bundle.insert("refresh_token".to_string(), json!("rt-999"));
        bundle
    }

    #[test]
    fn test_bundle_roundtrip() {
        let vault = test_vault();
        let bundle = sample_bundle();

        let blob = vault.encrypt_bundle(&bundle).unwrap();
        assert!(!blob.contains("s3cret"));

        let decrypted = vault.decrypt_bundle(&blob).unwrap();
        assert_eq!(decrypted, bundle);
    }

    #[test]
    fn test_bundle_encryption_nondeterministic() {
        let vault = test_vault();
        let bundle = sample_bundle();

        let blob1 = vault.encrypt_bundle(&bundle).unwrap();
        let blob2 = vault.encrypt_bundle(&bundle).unwrap();
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(SecretVault::new("short").is_err());
        assert!(SecretVault::new(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_kind_discrimination() {
        let mut bundle = sample_bundle();
        assert!(!is_token_bundle(&bundle));

        bundle.insert(KIND_KEY.to_string(), json!(KIND_APP));
        assert!(!is_token_bundle(&bundle));

        bundle.insert(KIND_KEY.to_string(), json!(KIND_TOKEN));
        assert!(is_token_bundle(&bundle));
    }

    #[test]
    fn test_bundle_str_skips_empty() {
        let mut bundle = sample_bundle();
        bundle.insert("empty".to_string(), json!(""));
        bundle.insert("number".to_string(), json!(42));

        assert_eq!(bundle_str(&bundle, "client_id"), Some("abc123"));
        assert_eq!(bundle_str(&bundle, "empty"), None);
        assert_eq!(bundle_str(&bundle, "number"), None);
        assert_eq!(bundle_str(&bundle, "missing"), None);
    }
}

//! Signing key abstraction
//!
//! The delivery path never handles raw key material directly: it hands a
//! SHA-256 digest of the signing string to a [`Signer`] and gets RSA
//! signature bytes back. Production deployments can back this with an
//! HSM/KMS; tests and simple deployments use an in-memory PEM key.

use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::SignatureEncoding;
use rsa::signature::hazmat::PrehashSigner;
use sha2::Sha256;

use crate::config::SigningConfig;
use crate::error::AppError;

/// Narrow signing capability: RSA-PKCS1v15-SHA256 over a precomputed hash
pub trait Signer: Send + Sync {
    /// Key identifier advertised in outbound Signature headers
    fn key_id(&self) -> &str;

    /// Sign a SHA-256 digest of the signing string
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, AppError>;
}

/// Signer backed by an in-memory RSA private key
pub struct LocalKeySigner {
    key_id: String,
    signing_key: rsa::pkcs1v15::SigningKey<Sha256>,
}

impl LocalKeySigner {
    /// Create a signer from a PKCS#8 PEM private key
    pub fn from_pem(private_key_pem: &str, key_id: String) -> Result<Self, AppError> {
        let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| AppError::Config(format!("Invalid signing key: {}", e)))?;

        Ok(Self {
            key_id,
            signing_key: rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Create a signer from configuration
    ///
    /// Accepts either an inline PEM or a key file path.
    pub fn from_config(signing: &SigningConfig, key_id: String) -> Result<Self, AppError> {
        if let Some(ref pem) = signing.private_key_pem {
            return Self::from_pem(pem, key_id);
        }

        if let Some(ref path) = signing.private_key_path {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!(
                    "Failed to read signing key {}: {}",
                    path.display(),
                    e
                ))
            })?;
            return Self::from_pem(&pem, key_id);
        }

        Err(AppError::Config("No signing key configured".to_string()))
    }
}

impl Signer for LocalKeySigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, AppError> {
        let signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| AppError::Federation(format!("Signing failed: {}", e)))?;

        Ok(signature.to_bytes().to_vec())
    }
}

//! RSA key material for HTTP Signatures.
//!
//! Instance actors sign every outbound delivery and dereference with an RSA key.
//! The key is either read from a PKCS#8 PEM file or generated at startup.
//!
//! ```
//! use outpost_common::crypto::RsaKeypair;
//!
//! let keypair = RsaKeypair::generate().expect("keygen");
//! let reloaded = RsaKeypair::from_private_pem(&keypair.private_key_pem).expect("reload");
//! assert_eq!(keypair.public_key_pem, reloaded.public_key_pem);
//! ```

use std::path::Path;

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};

use crate::{AppError, AppResult};

/// Default RSA key size (2048 bits).
const RSA_KEY_SIZE: usize = 2048;

/// RSA key pair in PEM form.
#[derive(Debug, Clone)]
pub struct RsaKeypair {
    /// Public key in PEM format (SPKI encoding).
    pub public_key_pem: String,
    /// Private key in PEM format (PKCS#8 encoding).
    pub private_key_pem: String,
}

impl RsaKeypair {
    /// Generate a fresh 2048-bit key pair.
    pub fn generate() -> AppResult<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_SIZE)
            .map_err(|e| AppError::Internal(format!("Failed to generate RSA key: {e}")))?;
        Self::from_private_key(&private_key)
    }

    /// Rebuild the pair from a PKCS#8 private key, deriving the public half.
    pub fn from_private_pem(pem: &str) -> AppResult<Self> {
        let private_key = parse_private_key(pem)?;
        Self::from_private_key(&private_key)
    }

    /// Read the private key from `path` when given, otherwise generate one.
    pub fn load_or_generate(path: Option<&Path>) -> AppResult<Self> {
        match path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    AppError::Config(format!("Failed to read key {}: {e}", path.display()))
                })?;
                Self::from_private_pem(&pem)
            }
            None => Self::generate(),
        }
    }

    fn from_private_key(private_key: &RsaPrivateKey) -> AppResult<Self> {
        let public_key = RsaPublicKey::from(private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(format!("Failed to encode private key: {e}")))?
            .to_string();

        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(format!("Failed to encode public key: {e}")))?;

        Ok(Self {
            public_key_pem,
            private_key_pem,
        })
    }
}

/// Parse a PKCS#8 RSA private key.
pub fn parse_private_key(pem: &str) -> AppResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| AppError::Signature(format!("Failed to parse private key: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rsa::pkcs8::DecodePublicKey;

    #[test]
    fn test_generate_keypair() {
        let keypair = RsaKeypair::generate().unwrap();

        assert!(keypair.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert!(keypair.private_key_pem.contains("BEGIN PRIVATE KEY"));
        RsaPublicKey::from_public_key_pem(&keypair.public_key_pem).unwrap();
    }

    #[test]
    fn test_load_without_path_generates() {
        let keypair = RsaKeypair::load_or_generate(None).unwrap();
        let reloaded = RsaKeypair::from_private_pem(&keypair.private_key_pem).unwrap();
        assert_eq!(keypair.public_key_pem, reloaded.public_key_pem);
    }

    #[test]
    fn test_garbage_key_is_rejected() {
        assert!(parse_private_key("not a key").is_err());
    }
}

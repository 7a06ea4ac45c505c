//! Node identity key.
//!
//! The Secp256k1 key pair is loaded once at startup and never mutated;
//! its public key derives the node's [`PeerId`].

use crate::types::PeerId;
use crate::{NetworkError, NetworkResult};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message as SecpMessage, PublicKey, SecretKey, SECP256K1};
use std::path::Path;
use tracing::info;

/// Node key pair and derived identifier.
#[derive(Clone)]
pub struct NodeKey {
    secret: SecretKey,
    public: PublicKey,
    id: PeerId,
}

impl NodeKey {
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key(SECP256K1);
        Self {
            secret,
            public,
            id: PeerId::from_public_key(&public),
        }
    }

    /// A fresh random key.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::new(&mut rand::thread_rng()))
    }

    /// Parse a hex-encoded 32-byte secret key.
    pub fn from_hex(s: &str) -> NetworkResult<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| NetworkError::InvalidKey(e.to_string()))?;
        let secret = SecretKey::from_slice(&raw)?;
        Ok(Self::from_secret(secret))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// Read the key at `path`, generating and saving one when the file is missing.
    pub fn load_or_generate(path: &Path) -> NetworkResult<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let key = Self::from_hex(&contents)?;
            info!(path = %path.display(), peer = %key.id, "Loaded node key");
            return Ok(key);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, key.to_hex())?;
        info!(path = %path.display(), peer = %key.id, "Generated new node key");
        Ok(key)
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Sign a 32-byte digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> NetworkResult<Signature> {
        let msg = SecpMessage::from_digest_slice(digest)?;
        Ok(SECP256K1.sign_ecdsa(&msg, &self.secret))
    }
}

/// Verify a signature over a 32-byte digest.
pub fn verify_digest(key: &PublicKey, digest: &[u8; 32], sig: &Signature) -> bool {
    match SecpMessage::from_digest_slice(digest) {
        Ok(msg) => SECP256K1.verify_ecdsa(&msg, sig, key).is_ok(),
        Err(_) => false,
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_or_generate_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("node.key");

        let first = NodeKey::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = NodeKey::load_or_generate(&path).unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_invalid_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(matches!(
            NodeKey::load_or_generate(&path),
            Err(NetworkError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let key = NodeKey::generate();
        let digest = [7u8; 32];
        let sig = key.sign_digest(&digest).unwrap();
        assert!(verify_digest(key.public(), &digest, &sig));
        assert!(!verify_digest(key.public(), &[8u8; 32], &sig));
    }
}

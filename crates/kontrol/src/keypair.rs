//! RSA key pairs with stable ids and rotation history.
//!
//! The newest pair signs everything; older pairs stay around so
//! tokens and kite keys they signed keep verifying.

use jsonwebtoken::{DecodingKey, EncodingKey};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum KeyPairError {
    #[error("bad public key: {0}")]
    BadPublicKey(String),
    #[error("bad private key: {0}")]
    BadPrivateKey(String),
    #[error("no key pairs configured")]
    Empty,
    #[error("unknown key pair {0}")]
    Unknown(String),
}

/// One RSA pair. The id is the hex SHA-256 fingerprint of the public
/// PEM, stable across restarts.
pub struct KeyPair {
    pub id: String,
    pub public_pem: String,
    pub private_pem: String,
    pub(crate) encoding: EncodingKey,
    pub(crate) decoding: DecodingKey,
}

impl KeyPair {
    pub fn new(public_pem: String, private_pem: String) -> Result<Self, KeyPairError> {
        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| KeyPairError::BadPrivateKey(e.to_string()))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| KeyPairError::BadPublicKey(e.to_string()))?;
        Ok(Self {
            id: fingerprint(&public_pem),
            public_pem,
            private_pem,
            encoding,
            decoding,
        })
    }
}

pub fn fingerprint(public_pem: &str) -> String {
    hex::encode(Sha256::digest(public_pem.trim().as_bytes()))
}

/// Rotation history; the last pair is current.
pub struct KeyPairs {
    pairs: Vec<KeyPair>,
}

impl KeyPairs {
    pub fn new(current: KeyPair) -> Self {
        Self {
            pairs: vec![current],
        }
    }

    /// Rotate in a new signing pair; the old ones remain valid for
    /// verification.
    pub fn add(&mut self, pair: KeyPair) {
        self.pairs.push(pair);
    }

    pub fn current(&self) -> &KeyPair {
        self.pairs.last().expect("KeyPairs is never empty")
    }

    pub fn by_id(&self, id: &str) -> Option<&KeyPair> {
        self.pairs.iter().find(|p| p.id == id)
    }

    pub fn by_public(&self, public_pem: &str) -> Option<&KeyPair> {
        self.pairs
            .iter()
            .find(|p| p.public_pem.trim() == public_pem.trim())
    }

    pub fn is_current(&self, id: &str) -> bool {
        self.current().id == id
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyPair> {
        self.pairs.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str =
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/keys/kontrol.pem"));
    const PUBLIC: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/kontrol.pub.pem"
    ));
    const ROTATED_PRIVATE: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/rotated.pem"
    ));
    const ROTATED_PUBLIC: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/rotated.pub.pem"
    ));

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint(PUBLIC);
        assert_eq!(a, fingerprint(&format!("{PUBLIC}\n")));
        assert_ne!(a, fingerprint(ROTATED_PUBLIC));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn garbage_pems_are_rejected() {
        assert!(KeyPair::new("not a pem".into(), PRIVATE.into()).is_err());
        assert!(KeyPair::new(PUBLIC.into(), "not a pem".into()).is_err());
    }

    #[test]
    fn rotation_keeps_history() {
        let mut pairs = KeyPairs::new(KeyPair::new(PUBLIC.into(), PRIVATE.into()).unwrap());
        let old_id = pairs.current().id.clone();
        pairs.add(KeyPair::new(ROTATED_PUBLIC.into(), ROTATED_PRIVATE.into()).unwrap());

        assert!(!pairs.is_current(&old_id));
        assert!(pairs.by_id(&old_id).is_some());
        assert!(pairs.by_public(PUBLIC).is_some());
        assert_eq!(pairs.current().public_pem, ROTATED_PUBLIC);
    }
}

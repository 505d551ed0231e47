//! Token and kite-key signing.
//!
//! Call tokens are cached per `(audience, subject)` and invalidated at
//! `TTL − leeway`, so every `getKites` hit inside the window reuses
//! one signature. Signing always uses the current key pair; the
//! `kontrolKey` claim carries its public half so receivers can verify
//! across rotation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{encode, Algorithm, Header};
use parking_lot::{Mutex, RwLock};

use kite_protocol::{KiteClaims, TOKEN_LEEWAY, TOKEN_TTL};

use crate::keypair::{KeyPairError, KeyPairs};

struct CachedToken {
    token: String,
    invalid_at: Instant,
}

pub struct TokenSigner {
    /// Kontrol's username; every token's issuer.
    issuer: String,
    keys: RwLock<KeyPairs>,
    cache: Mutex<HashMap<(String, String), CachedToken>>,
    token_ttl: Duration,
}

impl TokenSigner {
    pub fn new(issuer: String, keys: KeyPairs) -> Self {
        Self::with_ttl(issuer, keys, TOKEN_TTL)
    }

    pub fn with_ttl(issuer: String, keys: KeyPairs, token_ttl: Duration) -> Self {
        Self {
            issuer,
            keys: RwLock::new(keys),
            cache: Mutex::new(HashMap::new()),
            token_ttl,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keys(&self) -> &RwLock<KeyPairs> {
        &self.keys
    }

    pub fn current_public_key(&self) -> String {
        self.keys.read().current().public_pem.clone()
    }

    pub fn current_key_id(&self) -> String {
        self.keys.read().current().id.clone()
    }

    /// A call token for `subject` scoped to `audience`, from the cache
    /// when one is still comfortably inside its lifetime.
    pub fn sign_token(&self, audience: &str, subject: &str) -> Result<String, KeyPairError> {
        let cache_key = (audience.to_string(), subject.to_string());
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            if cached.invalid_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = KiteClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: Some(audience.to_string()),
            exp: Some(now + self.token_ttl.as_secs() as i64),
            nbf: Some(now),
            iat: Some(now),
            jti: uuid::Uuid::new_v4().to_string(),
            kontrol_url: None,
            kontrol_key: None,
        };
        let token = self.sign(&claims)?;
        self.cache.lock().insert(
            cache_key,
            CachedToken {
                token: token.clone(),
                invalid_at: Instant::now() + self.token_ttl.saturating_sub(TOKEN_LEEWAY),
            },
        );
        Ok(token)
    }

    /// A long-lived kite key for `username`, pinning the current
    /// kontrol public key and URL.
    pub fn sign_kite_key(
        &self,
        username: &str,
        kontrol_url: &str,
    ) -> Result<String, KeyPairError> {
        let claims = KiteClaims {
            iss: self.issuer.clone(),
            sub: username.to_string(),
            aud: None,
            exp: None,
            nbf: None,
            iat: Some(chrono::Utc::now().timestamp()),
            jti: uuid::Uuid::new_v4().to_string(),
            kontrol_url: Some(kontrol_url.to_string()),
            kontrol_key: Some(self.current_public_key()),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &KiteClaims) -> Result<String, KeyPairError> {
        let keys = self.keys.read();
        encode(&Header::new(Algorithm::RS256), claims, &keys.current().encoding)
            .map_err(|e| KeyPairError::BadPrivateKey(e.to_string()))
    }

    /// Verify a kite key against the key-pair history and return its
    /// claims plus the id of the pair that signed it.
    pub fn verify_kite_key(&self, token: &str) -> Result<(KiteClaims, String), KeyPairError> {
        let claims = KiteClaims::peek(token)
            .ok_or_else(|| KeyPairError::BadPublicKey("not a jwt".into()))?;

        let keys = self.keys.read();
        // The kontrolKey claim names the pair; fall back to trying the
        // history for keys signed before the claim existed.
        let candidates: Vec<&crate::keypair::KeyPair> = match claims
            .kontrol_key
            .as_deref()
            .and_then(|pem| keys.by_public(pem))
        {
            Some(pair) => vec![pair],
            None => keys.iter().collect(),
        };

        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.leeway = TOKEN_LEEWAY.as_secs();
        validation.validate_aud = false;
        validation.validate_exp = claims.exp.is_some();
        validation.set_required_spec_claims::<&str>(&[]);

        for pair in candidates {
            if let Ok(data) =
                jsonwebtoken::decode::<KiteClaims>(token, &pair.decoding, &validation)
            {
                if data.claims.iss != self.issuer {
                    return Err(KeyPairError::BadPublicKey(format!(
                        "invalid issuer: {}",
                        data.claims.iss
                    )));
                }
                return Ok((data.claims, pair.id.clone()));
            }
        }
        Err(KeyPairError::BadPublicKey("signature verifies under no known key".into()))
    }

    /// Drop cached tokens past their invalidation point.
    pub fn sweep_cache(&self) {
        let now = Instant::now();
        self.cache.lock().retain(|_, cached| cached.invalid_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeyPair;

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

    fn signer() -> TokenSigner {
        TokenSigner::new(
            "kontrol".into(),
            KeyPairs::new(KeyPair::new(PUBLIC.into(), PRIVATE.into()).unwrap()),
        )
    }

    #[test]
    fn tokens_carry_audience_and_expiry() {
        let signer = signer();
        let token = signer.sign_token("/alice/test", "alice").unwrap();
        let claims = KiteClaims::peek(&token).unwrap();
        assert_eq!(claims.aud.as_deref(), Some("/alice/test"));
        assert_eq!(claims.iss, "kontrol");
        assert_eq!(claims.sub, "alice");
        let exp = claims.exp.unwrap();
        let now = chrono::Utc::now().timestamp();
        assert!(exp > now + 47 * 3600 && exp <= now + 48 * 3600 + 5);
    }

    #[test]
    fn token_cache_reuses_signatures() {
        let signer = signer();
        let a = signer.sign_token("/alice", "alice").unwrap();
        let b = signer.sign_token("/alice", "alice").unwrap();
        assert_eq!(a, b);
        let c = signer.sign_token("/alice", "bob").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn short_ttl_tokens_are_not_cached_long() {
        let keys = KeyPairs::new(KeyPair::new(PUBLIC.into(), PRIVATE.into()).unwrap());
        let signer = TokenSigner::with_ttl("kontrol".into(), keys, Duration::from_secs(1));
        let a = signer.sign_token("/alice", "alice").unwrap();
        // TTL − leeway saturates to zero: nothing is reusable.
        let b = signer.sign_token("/alice", "alice").unwrap();
        // jti differs even when iat matches.
        assert_ne!(
            KiteClaims::peek(&a).unwrap().jti,
            KiteClaims::peek(&b).unwrap().jti
        );
    }

    #[test]
    fn kite_key_pins_the_current_public_key() {
        let signer = signer();
        let key = signer
            .sign_kite_key("alice", "http://127.0.0.1:4000/kite")
            .unwrap();
        let claims = KiteClaims::peek(&key).unwrap();
        assert_eq!(claims.kontrol_key.as_deref(), Some(PUBLIC));
        assert_eq!(
            claims.kontrol_url.as_deref(),
            Some("http://127.0.0.1:4000/kite")
        );
        assert!(claims.exp.is_none());

        let (verified, key_id) = signer.verify_kite_key(&key).unwrap();
        assert_eq!(verified.sub, "alice");
        assert_eq!(key_id, signer.current_key_id());
    }

    #[test]
    fn old_keys_verify_after_rotation() {
        let signer = signer();
        let old_key = signer
            .sign_kite_key("alice", "http://127.0.0.1:4000/kite")
            .unwrap();
        let old_id = signer.current_key_id();

        signer
            .keys()
            .write()
            .add(KeyPair::new(ROTATED_PUBLIC.into(), ROTATED_PRIVATE.into()).unwrap());

        let (_, key_id) = signer.verify_kite_key(&old_key).unwrap();
        assert_eq!(key_id, old_id);
        assert_ne!(signer.current_key_id(), old_id);
    }

    #[test]
    fn foreign_signatures_fail() {
        let signer = signer();
        let other = TokenSigner::new(
            "kontrol".into(),
            KeyPairs::new(KeyPair::new(ROTATED_PUBLIC.into(), ROTATED_PRIVATE.into()).unwrap()),
        );
        let token = other.sign_token("/alice", "alice").unwrap();
        assert!(signer.verify_kite_key(&token).is_err());
    }
}

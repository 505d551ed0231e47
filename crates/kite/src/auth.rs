//! Authenticators and JWT verification.
//!
//! Two authenticator types ship with the core: `kiteKey` (a long-lived
//! JWT signed by kontrol) and `token` (a short-lived call token).
//! Verification trusts the configured kontrol public key, or the
//! token's own `kontrolKey` claim when the verifier accepts it — the
//! hook that keeps old kites working across key rotation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use kite_protocol::{KiteClaims, TOKEN_LEEWAY};

use crate::error::KiteError;
use crate::request::Request;

/// Default lifetime of a verify-cache entry.
pub const VERIFY_TTL: Duration = Duration::from_secs(5 * 60);

/// Delegated trust decision for a public key seen in a `kontrolKey`
/// claim. The default is strict equality against the configured key.
pub type KeyVerifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// An application-registered authenticator; returns the authenticated
/// username.
pub type Authenticator =
    Arc<dyn Fn(Arc<Request>) -> BoxFuture<'static, Result<String, KiteError>> + Send + Sync>;

pub(crate) struct AuthState {
    pub kontrol_user: Mutex<String>,
    pub kontrol_key: Mutex<Option<String>>,
    pub verify_cache: Arc<VerifyCache>,
    pub key_verifier: Mutex<Option<KeyVerifier>>,
    pub authenticators: RwLock<HashMap<String, Authenticator>>,
}

impl AuthState {
    pub fn new(kontrol_user: String, kontrol_key: Option<String>) -> Self {
        Self {
            kontrol_user: Mutex::new(kontrol_user),
            kontrol_key: Mutex::new(kontrol_key),
            verify_cache: Arc::new(VerifyCache::new(VERIFY_TTL)),
            key_verifier: Mutex::new(None),
            authenticators: RwLock::new(HashMap::new()),
        }
    }
}

/// TTL cache of `public key → trusted?` decisions, swept at half TTL.
pub struct VerifyCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (bool, Instant)>>,
}

impl VerifyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        let entries = self.entries.lock();
        let (trusted, at) = entries.get(key)?;
        if at.elapsed() > self.ttl {
            return None;
        }
        Some(*trusted)
    }

    pub fn put(&self, key: &str, trusted: bool) {
        self.entries
            .lock()
            .insert(key.to_string(), (trusted, Instant::now()));
    }

    fn sweep(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, at)| at.elapsed() <= self.ttl);
    }

    pub(crate) fn spawn_sweeper(cache: Arc<VerifyCache>, cancel: CancellationToken) {
        // Kites may be constructed before the runtime exists; entries
        // then age out lazily via the read path.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let mut tick = tokio::time::interval(cache.ttl / 2);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => cache.sweep(),
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

/// Pick the key a token must verify under: the `kontrolKey` claim when
/// trusted, the configured kontrol key otherwise.
fn resolve_key(state: &AuthState, claim_key: Option<&str>) -> Result<String, KiteError> {
    let configured = state.kontrol_key.lock().clone();
    if let Some(candidate) = claim_key {
        if is_trusted(state, candidate, configured.as_deref()) {
            return Ok(candidate.to_string());
        }
    }
    configured.ok_or_else(|| KiteError::Authentication("no kontrol key to verify against".into()))
}

fn is_trusted(state: &AuthState, candidate: &str, configured: Option<&str>) -> bool {
    if let Some(hit) = state.verify_cache.get(candidate) {
        return hit;
    }
    let verifier = state.key_verifier.lock().clone();
    let trusted = match verifier {
        Some(verify) => verify(candidate),
        None => configured == Some(candidate),
    };
    state.verify_cache.put(candidate, trusted);
    trusted
}

fn decode_claims(
    token: &str,
    key_pem: &str,
    expected_issuer: &str,
    require_exp: bool,
) -> Result<KiteClaims, KiteError> {
    let decoding = DecodingKey::from_rsa_pem(key_pem.as_bytes())
        .map_err(|e| KiteError::Authentication(format!("bad kontrol key: {e}")))?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.leeway = TOKEN_LEEWAY.as_secs();
    validation.validate_aud = false;
    validation.validate_nbf = true;
    if require_exp {
        validation.set_required_spec_claims(&["exp"]);
    } else {
        // Kite keys are long-lived; only validate exp when present.
        validation.set_required_spec_claims::<&str>(&[]);
        validation.validate_exp = KiteClaims::peek(token)
            .map(|c| c.exp.is_some())
            .unwrap_or(false);
    }

    let data = decode::<KiteClaims>(token, &decoding, &validation).map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => {
                KiteError::Authentication("token is expired".into())
            }
            _ => KiteError::Authentication(format!("invalid token: {e}")),
        }
    })?;

    if data.claims.iss != expected_issuer {
        return Err(KiteError::Authentication(format!(
            "invalid issuer: {}",
            data.claims.iss
        )));
    }
    Ok(data.claims)
}

/// Verify a kite key and return its claims.
pub(crate) fn verify_kite_key(state: &AuthState, token: &str) -> Result<KiteClaims, KiteError> {
    let claim_key = KiteClaims::peek(token).and_then(|c| c.kontrol_key);
    let key = resolve_key(state, claim_key.as_deref())?;
    let issuer = state.kontrol_user.lock().clone();
    decode_claims(token, &key, &issuer, false)
}

/// Verify a call token presented to `receiver` and return its claims.
pub(crate) fn verify_token(
    state: &AuthState,
    token: &str,
    receiver: &kite_protocol::Kite,
) -> Result<KiteClaims, KiteError> {
    let claim_key = KiteClaims::peek(token).and_then(|c| c.kontrol_key);
    let key = resolve_key(state, claim_key.as_deref())?;
    let issuer = state.kontrol_user.lock().clone();
    let claims = decode_claims(token, &key, &issuer, true)?;

    let audience = claims
        .aud
        .as_deref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| KiteError::Authentication("token has no audience".into()))?;
    if !receiver.allows_audience(audience) {
        return Err(KiteError::Authentication(format!(
            "audience does not match the kite: {audience}"
        )));
    }
    Ok(claims)
}

impl crate::runtime::KiteCore {
    /// The auth gate: dispatch on `authentication.type` and return the
    /// authenticated username. Unknown types are an
    /// `authenticationError`.
    pub(crate) async fn authenticate(
        self: &Arc<Self>,
        request: &Arc<Request>,
    ) -> Result<String, KiteError> {
        let Some(auth) = request.auth.clone() else {
            return Err(KiteError::Authentication(
                "no authentication key provided".into(),
            ));
        };
        match auth.kind.as_str() {
            "kiteKey" => {
                let claims = verify_kite_key(&self.auth, &auth.key)?;
                Ok(claims.sub)
            }
            "token" => {
                let claims = verify_token(&self.auth, &auth.key, &self.identity())?;
                Ok(claims.sub)
            }
            other => {
                let custom = self.auth.authenticators.read().get(other).cloned();
                match custom {
                    Some(authenticate) => authenticate(request.clone()).await,
                    None => Err(KiteError::Authentication(format!(
                        "unknown authentication type: {other}"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use kite_protocol::Kite;

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

    fn state() -> AuthState {
        AuthState::new("kontrol".into(), Some(PUBLIC.to_string()))
    }

    fn receiver() -> Kite {
        Kite {
            username: "alice".into(),
            environment: "test".into(),
            name: "worker".into(),
            version: "0.1.0".into(),
            region: "local".into(),
            hostname: "host".into(),
            id: "kite-1".into(),
        }
    }

    fn sign(claims: &KiteClaims, key: &str) -> String {
        encode(
            &Header::new(Algorithm::RS256),
            claims,
            &EncodingKey::from_rsa_pem(key.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    fn token_claims(aud: &str, exp_offset: i64) -> KiteClaims {
        let now = chrono::Utc::now().timestamp();
        KiteClaims {
            iss: "kontrol".into(),
            sub: "alice".into(),
            aud: Some(aud.into()),
            exp: Some(now + exp_offset),
            nbf: Some(now),
            iat: Some(now),
            jti: "t-1".into(),
            kontrol_url: None,
            kontrol_key: None,
        }
    }

    #[test]
    fn valid_token_passes() {
        let token = sign(&token_claims("/alice", 3600), PRIVATE);
        let claims = verify_token(&state(), &token, &receiver()).expect("valid");
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn superuser_audience_passes() {
        let token = sign(&token_claims("/", 3600), PRIVATE);
        verify_token(&state(), &token, &receiver()).expect("superuser");
    }

    #[test]
    fn wrong_audience_fails() {
        let token = sign(&token_claims("/bob", 3600), PRIVATE);
        let err = verify_token(&state(), &token, &receiver()).unwrap_err();
        assert!(err.to_string().contains("audience"));
    }

    #[test]
    fn deep_audience_prefix_rules() {
        let ok = sign(&token_claims("/alice/test/worker", 3600), PRIVATE);
        verify_token(&state(), &ok, &receiver()).expect("prefix audience");
        let bad = sign(&token_claims("/alice/production", 3600), PRIVATE);
        assert!(verify_token(&state(), &bad, &receiver()).is_err());
    }

    #[test]
    fn expired_token_names_the_phrase() {
        // Stale beyond the one-minute leeway.
        let token = sign(&token_claims("/alice", -120), PRIVATE);
        let err = verify_token(&state(), &token, &receiver()).unwrap_err();
        assert!(err.to_string().contains("token is expired"));
        assert!(err.is_token_expired());
    }

    #[test]
    fn expiry_within_leeway_passes() {
        let token = sign(&token_claims("/alice", -30), PRIVATE);
        verify_token(&state(), &token, &receiver()).expect("inside leeway");
    }

    #[test]
    fn wrong_issuer_fails() {
        let mut claims = token_claims("/alice", 3600);
        claims.iss = "impostor".into();
        let token = sign(&claims, PRIVATE);
        let err = verify_token(&state(), &token, &receiver()).unwrap_err();
        assert!(err.to_string().contains("issuer"));
    }

    #[test]
    fn bad_signature_fails() {
        let token = sign(&token_claims("/alice", 3600), ROTATED_PRIVATE);
        assert!(verify_token(&state(), &token, &receiver()).is_err());
    }

    #[test]
    fn kite_key_without_exp_verifies() {
        let claims = KiteClaims {
            iss: "kontrol".into(),
            sub: "alice".into(),
            jti: "k-1".into(),
            kontrol_key: Some(PUBLIC.to_string()),
            ..Default::default()
        };
        let token = sign(&claims, PRIVATE);
        let claims = verify_kite_key(&state(), &token).expect("kite key");
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn rotation_hook_accepts_new_key() {
        // Token signed by a rotated pair, carrying the new public key;
        // the injected verifier vouches for it.
        let mut claims = token_claims("/alice", 3600);
        claims.kontrol_key = Some(ROTATED_PUBLIC.to_string());
        let token = sign(&claims, ROTATED_PRIVATE);

        let state = state();
        assert!(verify_token(&state, &token, &receiver()).is_err());

        *state.key_verifier.lock() = Some(Arc::new(|_key: &str| true));
        state.verify_cache.put(ROTATED_PUBLIC, true); // refresh past the cached refusal
        verify_token(&state, &token, &receiver()).expect("rotated key accepted");
    }

    #[test]
    fn verify_cache_expires() {
        let cache = VerifyCache::new(Duration::from_millis(20));
        cache.put("key", true);
        assert_eq!(cache.get("key"), Some(true));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("key"), None);
        cache.sweep();
        assert!(cache.entries.lock().is_empty());
    }
}

//! JWT claims carried by kite keys and call tokens.
//!
//! Both flavors are RS256 JWTs signed by kontrol. A kite key is
//! long-lived, names its owner in `sub`, and pins the kontrol public
//! key the kite should trust in `kontrolKey`. A call token is
//! short-lived and scopes where it may be presented via `aud`, a
//! canonical kite-query path.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KiteClaims {
    /// Kontrol username that issued this token.
    pub iss: String,
    /// Owning user.
    pub sub: String,
    /// Audience path; absent on kite keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Expiry, unix seconds. Kite keys carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Token id.
    #[serde(default)]
    pub jti: String,
    /// Kontrol URL at time of issue (kite keys only).
    #[serde(rename = "kontrolURL", default, skip_serializing_if = "Option::is_none")]
    pub kontrol_url: Option<String>,
    /// Kontrol public key at time of issue (kite keys only). This is
    /// the trust anchor for every token the holding kite verifies.
    #[serde(rename = "kontrolKey", default, skip_serializing_if = "Option::is_none")]
    pub kontrol_key: Option<String>,
}

impl KiteClaims {
    /// Decode the claims without verifying the signature. Used to read
    /// the `kontrolKey` trust anchor out of a kite key before any key
    /// material is known, and to read `exp` for renewal scheduling.
    pub fn peek(token: &str) -> Option<Self> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_reads_unverified_payload() {
        let payload = serde_json::json!({
            "iss": "kontrol",
            "sub": "alice",
            "jti": "t-1",
            "kontrolKey": "PEM",
        });
        let token = format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        );
        let claims = KiteClaims::peek(&token).expect("decodes");
        assert_eq!(claims.iss, "kontrol");
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.kontrol_key.as_deref(), Some("PEM"));
    }

    #[test]
    fn peek_rejects_garbage() {
        assert!(KiteClaims::peek("not-a-jwt").is_none());
        assert!(KiteClaims::peek("a.%%%.c").is_none());
    }
}

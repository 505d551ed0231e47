//! Pre-expiry token renewal.
//!
//! One message-driven task per token-authenticated client. Renew
//! signals come from a timer armed at `exp − 30s`, from the read path
//! when a peer reports `"token is expired"`, and from reconnects. The
//! task swaps the client's auth key atomically and re-arms from the
//! fresh token's `exp`.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use kite_protocol::{Authentication, KiteClaims};

use crate::client::Client;
use crate::kontrol::KontrolClient;

/// Renew this long before `exp`.
pub const RENEW_BEFORE: Duration = Duration::from_secs(30);

/// Retry cadence after a failed renewal.
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub(crate) enum RenewSignal {
    /// A remote end reported the token expired.
    Expired,
    /// The session reconnected; the token may have aged out meanwhile.
    Reconnected,
}

/// Start a renewer for `client`, whose current auth is a token for
/// `kite`. Returns a subscription to renewed tokens.
pub(crate) fn spawn_renewer(
    client: Client,
    kontrol: KontrolClient,
    kite: kite_protocol::Kite,
) -> broadcast::Receiver<String> {
    let (signal_tx, mut signal_rx) = mpsc::channel::<RenewSignal>(4);
    *client.inner.renew_tx.lock() = Some(signal_tx);
    let (renewed_tx, renewed_rx) = broadcast::channel(4);

    tokio::spawn(async move {
        let closed = client.close_cancelled();
        loop {
            let sleep_for = time_until_renewal(client.auth().as_ref());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => {
                            tracing::debug!(kite = %kite.key(), ?signal, "renewal signal");
                        }
                        None => return,
                    }
                }
                _ = closed.cancelled() => return,
            }

            // Renew, retrying until it works or the client goes away.
            loop {
                match kontrol.get_token(&kite).await {
                    Ok(token) => {
                        client.set_auth(Authentication::token(token.clone()));
                        let _ = renewed_tx.send(token);
                        tracing::debug!(kite = %kite.key(), "token renewed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(kite = %kite.key(), error = %e, "token renewal failed");
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                            _ = closed.cancelled() => return,
                        }
                    }
                }
            }
        }
    });

    renewed_rx
}

/// How long to sleep before the next scheduled renewal, from the
/// current token's `exp`. Tokens without a readable expiry renew on
/// signals only.
fn time_until_renewal(auth: Option<&Authentication>) -> Duration {
    let exp = auth
        .filter(|a| a.kind == "token")
        .and_then(|a| KiteClaims::peek(&a.key))
        .and_then(|c| c.exp);
    match exp {
        Some(exp) => {
            let due = exp - RENEW_BEFORE.as_secs() as i64;
            let now = chrono::Utc::now().timestamp();
            // Floor of one second keeps very short-lived tokens from
            // renewing in a tight loop.
            Duration::from_secs((due - now).max(1) as u64)
        }
        // Signals only; re-armed every pass through the loop.
        None => Duration::from_secs(30 * 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn fake_token(exp: i64) -> String {
        let payload = serde_json::json!({
            "iss": "kontrol", "sub": "u", "jti": "t", "exp": exp,
        });
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        )
    }

    #[test]
    fn renewal_is_scheduled_before_expiry() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let auth = Authentication::token(fake_token(exp));
        let wait = time_until_renewal(Some(&auth));
        assert!(wait <= Duration::from_secs(3600 - 30));
        assert!(wait > Duration::from_secs(3500));
    }

    #[test]
    fn past_expiry_renews_at_the_floor() {
        let auth = Authentication::token(fake_token(chrono::Utc::now().timestamp() - 10));
        assert_eq!(time_until_renewal(Some(&auth)), Duration::from_secs(1));
    }

    #[test]
    fn unreadable_tokens_wait_for_signals() {
        let auth = Authentication::token("opaque");
        assert!(time_until_renewal(Some(&auth)) > Duration::from_secs(86400));
        assert!(time_until_renewal(None) > Duration::from_secs(86400));
    }
}

//! Session URL assembly.
//!
//! A SockJS session lives at `<base>/<3-digit-server>/<20-char-session>`;
//! the two extra path components give load balancers something sticky to
//! hash on. The websocket transport appends `/websocket` and swaps the
//! scheme to `ws`/`wss`.

use rand::Rng;
use url::Url;

use crate::SockJsError;

const SESSION_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A random 3-digit server id, `000`–`999`.
pub fn random_server_id() -> String {
    format!("{:03}", rand::thread_rng().gen_range(0..1000))
}

/// A random 20-character lowercase alphanumeric session id.
pub fn random_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| SESSION_CHARS[rng.gen_range(0..SESSION_CHARS.len())] as char)
        .collect()
}

/// `<base>/<server>/<session>` with an explicit port (80/443 default).
pub fn session_url(base: &str, server_id: &str, session_id: &str) -> Result<Url, SockJsError> {
    let mut url = Url::parse(base).map_err(|e| SockJsError::BadUrl(e.to_string()))?;
    let default_port = match url.scheme() {
        "http" | "ws" => 80,
        "https" | "wss" => 443,
        other => return Err(SockJsError::BadUrl(format!("unsupported scheme {other}"))),
    };
    if url.port().is_none() {
        // Url refuses set_port on known default ports; that is fine,
        // the serialized form is equivalent.
        let _ = url.set_port(Some(default_port));
    }
    url.path_segments_mut()
        .map_err(|_| SockJsError::BadUrl("cannot-be-a-base url".into()))?
        .pop_if_empty()
        .push(server_id)
        .push(session_id);
    Ok(url)
}

/// The websocket transport endpoint for a session: scheme swapped to
/// `ws`/`wss`, `/websocket` appended.
pub fn websocket_url(base: &str, server_id: &str, session_id: &str) -> Result<Url, SockJsError> {
    let mut url = session_url(base, server_id, session_id)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SockJsError::BadUrl(format!("unsupported scheme {other}"))),
    };
    let _ = url.set_scheme(scheme);
    url.path_segments_mut()
        .map_err(|_| SockJsError::BadUrl("cannot-be-a-base url".into()))?
        .push("websocket");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_shape() {
        let url = websocket_url("http://example.com/kite", "123", "abcdefghij0123456789").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://example.com/kite/123/abcdefghij0123456789/websocket"
        );
    }

    #[test]
    fn https_becomes_wss() {
        let url = websocket_url("https://example.com:8443/kite", "000", "s").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let url = session_url("http://example.com/kite/", "001", "x").unwrap();
        assert_eq!(url.path(), "/kite/001/x");
    }

    #[test]
    fn ids_have_expected_shape() {
        let server = random_server_id();
        assert_eq!(server.len(), 3);
        assert!(server.bytes().all(|b| b.is_ascii_digit()));
        let session = random_session_id();
        assert_eq!(session.len(), 20);
        assert!(session.bytes().all(|b| SESSION_CHARS.contains(&b)));
    }
}

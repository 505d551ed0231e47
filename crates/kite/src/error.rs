//! Typed errors surfaced by calls and sessions.
//!
//! Every variant maps 1:1 to a wire error type; application errors
//! received from a peer keep their original type and request id.

use std::time::Duration;

use kite_protocol::WireError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KiteError {
    /// An error the remote side returned verbatim.
    #[error("{0}")]
    Remote(WireError),
    #[error("sendError: {0}")]
    Send(String),
    #[error("timeout: no response after {0:?}")]
    Timeout(Duration),
    #[error("disconnect: remote kite disconnected")]
    Disconnect,
    #[error("invalidResponse: {0}")]
    InvalidResponse(String),
    #[error("methodNotFound: {0}")]
    MethodNotFound(String),
    #[error("callbackNotFound: {0}")]
    CallbackNotFound(u64),
    #[error("authenticationError: {0}")]
    Authentication(String),
    #[error("argumentError: {0}")]
    Argument(String),
    #[error("requestLimitError: request rate limit exceeded")]
    RequestLimit,
    #[error("watchError: {0}")]
    Watch(String),
    #[error("genericError: {0}")]
    Generic(String),
}

impl KiteError {
    /// The wire `type` tag for this error.
    pub fn kind(&self) -> &str {
        match self {
            KiteError::Remote(e) => &e.kind,
            KiteError::Send(_) => "sendError",
            KiteError::Timeout(_) => "timeout",
            KiteError::Disconnect => "disconnect",
            KiteError::InvalidResponse(_) => "invalidResponse",
            KiteError::MethodNotFound(_) => "methodNotFound",
            KiteError::CallbackNotFound(_) => "callbackNotFound",
            KiteError::Authentication(_) => "authenticationError",
            KiteError::Argument(_) => "argumentError",
            KiteError::RequestLimit => "requestLimitError",
            KiteError::Watch(_) => "watchError",
            KiteError::Generic(_) => "genericError",
        }
    }

    pub fn to_wire(&self, request_id: &str) -> WireError {
        let wire = match self {
            KiteError::Remote(e) => e.clone(),
            KiteError::MethodNotFound(m) => WireError::method_not_found(m),
            KiteError::CallbackNotFound(id) => WireError::callback_not_found(*id),
            KiteError::RequestLimit => WireError::request_limit(),
            other => WireError::new(other.kind(), other.message()),
        };
        if wire.request_id.is_empty() && !request_id.is_empty() {
            wire.with_request_id(request_id)
        } else {
            wire
        }
    }

    fn message(&self) -> String {
        match self {
            KiteError::Remote(e) => e.message.clone(),
            KiteError::Send(m)
            | KiteError::InvalidResponse(m)
            | KiteError::Authentication(m)
            | KiteError::Argument(m)
            | KiteError::Watch(m)
            | KiteError::Generic(m) => m.clone(),
            KiteError::Timeout(d) => format!("no response after {d:?}"),
            KiteError::Disconnect => "remote kite disconnected".into(),
            KiteError::MethodNotFound(m) => format!("method not found: {m}"),
            KiteError::CallbackNotFound(id) => format!("callback not found: {id}"),
            KiteError::RequestLimit => "request rate limit exceeded".into(),
        }
    }

    /// Whether the remote end reported an expired token.
    pub fn is_token_expired(&self) -> bool {
        matches!(self, KiteError::Remote(e) if e.is_token_expired())
            || matches!(self, KiteError::Authentication(m) if m.contains("token is expired"))
    }
}

impl From<WireError> for KiteError {
    fn from(err: WireError) -> Self {
        KiteError::Remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_conversion_keeps_request_id() {
        let err = KiteError::Authentication("bad signature".into());
        let wire = err.to_wire("r-9");
        assert_eq!(wire.kind, "authenticationError");
        assert_eq!(wire.request_id, "r-9");
    }

    #[test]
    fn remote_errors_pass_through() {
        let wire = WireError::generic("boom").with_request_id("orig");
        let err = KiteError::from(wire.clone());
        assert_eq!(err.to_wire("other"), wire); // original id wins
    }

    #[test]
    fn token_expiry_detection() {
        let err = KiteError::Remote(kite_protocol::WireError::authentication_error(
            "token is expired",
        ));
        assert!(err.is_token_expired());
        assert!(!KiteError::Disconnect.is_token_expired());
    }
}

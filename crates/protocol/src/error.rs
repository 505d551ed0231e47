//! Wire-level errors: typed values carried inside response payloads.

use serde::{Deserialize, Serialize};

/// An error as it travels over the wire:
/// `{"type": ..., "message": ..., "code": ..., "id": ...}`.
///
/// `id` is the request id of the call that produced the error, when
/// one exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "id")]
    pub request_id: String,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            code: String::new(),
            request_id: String::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn send_error(message: impl Into<String>) -> Self {
        Self::new("sendError", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("timeout", message)
    }

    pub fn disconnect(message: impl Into<String>) -> Self {
        Self::new("disconnect", message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new("invalidResponse", message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new("methodNotFound", format!("method not found: {method}"))
    }

    pub fn callback_not_found(id: u64) -> Self {
        Self::new("callbackNotFound", format!("callback not found: {id}"))
    }

    pub fn authentication_error(message: impl Into<String>) -> Self {
        Self::new("authenticationError", message)
    }

    pub fn argument_error(message: impl Into<String>) -> Self {
        Self::new("argumentError", message)
    }

    pub fn request_limit() -> Self {
        Self::new("requestLimitError", "request rate limit exceeded")
    }

    pub fn watch_error(message: impl Into<String>) -> Self {
        Self::new("watchError", message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new("genericError", message)
    }

    /// Whether a remote end reported an expired token; the renewer
    /// keys off this phrase.
    pub fn is_token_expired(&self) -> bool {
        self.kind == "authenticationError" && self.message.contains("token is expired")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let err = WireError::method_not_found("echo").with_request_id("r-1");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "type": "methodNotFound",
                "message": "method not found: echo",
                "id": "r-1",
            })
        );
    }

    #[test]
    fn token_expired_detection() {
        let err = WireError::authentication_error("token is expired");
        assert!(err.is_token_expired());
        assert!(!WireError::timeout("token is expired").is_token_expired());
    }
}

//! Wire shapes of the kontrol RPC surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kite::Kite;
use crate::query::KiteQuery;

/// Arguments of `register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterArgs {
    pub url: String,
}

/// Result of `register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResult {
    /// The URL the kite is now registered under (may differ when a
    /// proxy rewrote it).
    pub url: String,
    /// Heartbeat period in seconds.
    pub heartbeat_interval: i64,
    /// A fresh kite key, present when the caller's key pair was
    /// rotated out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kite_key: Option<String>,
    /// The current kontrol public key, for the same rotation case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Arguments of `getKites`. The watch callback, when present, rides in
/// the same object as a function placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetKitesArgs {
    pub query: KiteQuery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_callback: Option<Value>,
    /// Identity of the requesting kite, used by load-balancing
    /// deployments; opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who: Option<Value>,
}

/// One discovered kite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiteWithToken {
    pub kite: Kite,
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// Result of `getKites`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetKitesResult {
    pub kites: Vec<KiteWithToken>,
    #[serde(
        default,
        rename = "watcherID",
        skip_serializing_if = "Option::is_none"
    )]
    pub watcher_id: Option<String>,
}

/// Body of kontrol's `POST /register` HTTP endpoint: the RPC call's
/// fields, flattened out of the call-options envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterHttpRequest {
    pub url: String,
    pub kite: Kite,
    pub authentication: crate::message::Authentication,
}

/// Arguments of `registerMachine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMachineArgs {
    pub username: String,
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub key: String,
}

/// A registration change observed by a watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiteEvent {
    pub action: EventAction,
    pub kite: Kite,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Register,
    Deregister,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_action_spelling() {
        let e = KiteEvent {
            action: EventAction::Register,
            kite: Kite::default(),
            url: Some("http://127.0.0.1:7777/kite".into()),
            token: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["action"], "Register");
        assert_eq!(
            serde_json::to_value(EventAction::Deregister).unwrap(),
            "Deregister"
        );
    }

    #[test]
    fn get_kites_result_camel_case() {
        let r = GetKitesResult {
            kites: vec![],
            watcher_id: Some("w-1".into()),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["watcherID"], "w-1");
    }
}

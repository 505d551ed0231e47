//! The dnode message envelope and callback-reference marshaling.
//!
//! A message has three fields: `method` (a string name for calls, an
//! integer id for callback invocations), `arguments` (a JSON array),
//! and `callbacks` (a map from callback id to the path of its
//! placeholder inside `arguments`). Paths are sequences of object keys
//! and decimal array indices, rooted at the arguments array itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;
use crate::kite::Kite;

/// Key of a callback placeholder object.
pub const FUNCTION_KEY: &str = "[Function]";

/// Method selector: user-facing methods go by name, callback
/// invocations by the numeric id the scrubber assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodId {
    Callback(u64),
    Name(String),
}

impl MethodId {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            MethodId::Name(n) => Some(n),
            MethodId::Callback(_) => None,
        }
    }

    pub fn as_callback(&self) -> Option<u64> {
        match self {
            MethodId::Callback(id) => Some(*id),
            MethodId::Name(_) => None,
        }
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodId::Name(n) => f.write_str(n),
            MethodId::Callback(id) => write!(f, "#{id}"),
        }
    }
}

/// A callback placeholder: `{"[Function]": <id>}`.
///
/// The id is meaningful to the side that created the placeholder; the
/// receiver invokes it by sending a message whose `method` is that id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    #[serde(rename = "[Function]")]
    pub id: u64,
}

impl FunctionRef {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// The placeholder as a JSON value, for embedding in argument trees.
    pub fn to_value(self) -> Value {
        serde_json::json!({ FUNCTION_KEY: self.id })
    }

    /// Parse a placeholder object back into a reference.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        obj.get(FUNCTION_KEY)?.as_u64().map(Self::new)
    }
}

/// One dnode message — exactly one SockJS text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub method: MethodId,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub callbacks: BTreeMap<String, Vec<String>>,
}

impl Message {
    /// Build an outgoing message: walks `arguments` for callback
    /// placeholders and records their paths.
    pub fn new(method: MethodId, arguments: Vec<Value>) -> Self {
        let callbacks = scrub(&arguments);
        Self {
            method,
            arguments,
            callbacks,
        }
    }

    /// The function reference at `path`, if the placeholder is present
    /// and well-formed.
    pub fn function_at(&self, path: &[&str]) -> Option<FunctionRef> {
        let owned: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        walk_path(&self.arguments, &owned).and_then(FunctionRef::from_value)
    }

    /// Function references in scrubber-numbering order, with their paths.
    pub fn functions(&self) -> Vec<(u64, Vec<String>)> {
        let mut out: Vec<(u64, Vec<String>)> = self
            .callbacks
            .iter()
            .filter_map(|(id, path)| id.parse::<u64>().ok().map(|id| (id, path.clone())))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

/// Walk the argument tree and record the path of every callback
/// placeholder, keyed by the placeholder's decimal id.
pub fn scrub(arguments: &[Value]) -> BTreeMap<String, Vec<String>> {
    let mut callbacks = BTreeMap::new();
    for (i, arg) in arguments.iter().enumerate() {
        scrub_value(arg, &mut vec![i.to_string()], &mut callbacks);
    }
    callbacks
}

fn scrub_value(value: &Value, path: &mut Vec<String>, out: &mut BTreeMap<String, Vec<String>>) {
    if let Some(func) = FunctionRef::from_value(value) {
        out.insert(func.id.to_string(), path.clone());
        return;
    }
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                scrub_value(item, path, out);
                path.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                path.push(key.clone());
                scrub_value(item, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Resolve a callback path against an arguments array. The first
/// segment indexes the array; the rest descend through objects and
/// arrays.
pub fn walk_path<'a>(arguments: &'a [Value], path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut cursor = arguments.get(first.parse::<usize>().ok()?)?;
    for segment in rest {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

/// The single argument of a user-invoked method call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    /// Identity of the calling kite.
    pub kite: Kite,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub with_args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_callback: Option<FunctionRef>,
}

/// Credential presented with a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// `"kiteKey"`, `"token"`, or an application-registered type.
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
}

impl Authentication {
    pub fn kite_key(key: impl Into<String>) -> Self {
        Self {
            kind: "kiteKey".into(),
            key: key.into(),
        }
    }

    pub fn token(key: impl Into<String>) -> Self {
        Self {
            kind: "token".into(),
            key: key.into(),
        }
    }
}

/// The single argument a response callback is invoked with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ResponsePayload {
    pub fn ok(result: Value) -> Self {
        Self {
            error: None,
            result: Some(result),
        }
    }

    pub fn err(error: WireError) -> Self {
        Self {
            error: Some(error),
            result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_id_untagged_roundtrip() {
        let name: MethodId = serde_json::from_str("\"echo\"").unwrap();
        assert_eq!(name, MethodId::Name("echo".into()));
        let cb: MethodId = serde_json::from_str("3").unwrap();
        assert_eq!(cb, MethodId::Callback(3));
        assert_eq!(serde_json::to_string(&cb).unwrap(), "3");
    }

    #[test]
    fn function_ref_placeholder_shape() {
        let v = FunctionRef::new(7).to_value();
        assert_eq!(v, json!({"[Function]": 7}));
        assert_eq!(FunctionRef::from_value(&v), Some(FunctionRef::new(7)));
        // Extra keys disqualify the object.
        assert_eq!(
            FunctionRef::from_value(&json!({"[Function]": 7, "x": 1})),
            None
        );
    }

    #[test]
    fn scrub_records_nested_paths() {
        let args = vec![json!({
            "withArgs": ["bar", {"[Function]": 2}],
            "responseCallback": {"[Function]": 1},
        })];
        let callbacks = scrub(&args);
        assert_eq!(
            callbacks.get("1"),
            Some(&vec!["0".to_string(), "responseCallback".to_string()])
        );
        assert_eq!(
            callbacks.get("2"),
            Some(&vec![
                "0".to_string(),
                "withArgs".to_string(),
                "1".to_string()
            ])
        );
    }

    #[test]
    fn walk_path_resolves_arrays_and_objects() {
        let args = vec![json!({"a": [10, {"b": 42}]})];
        let path = vec!["0".to_string(), "a".to_string(), "1".to_string(), "b".to_string()];
        assert_eq!(walk_path(&args, &path), Some(&json!(42)));
        let missing = vec!["0".to_string(), "nope".to_string()];
        assert_eq!(walk_path(&args, &missing), None);
    }

    #[test]
    fn message_wire_shape() {
        let msg = Message::new(
            MethodId::Name("echo".into()),
            vec![json!({"responseCallback": {"[Function]": 0}})],
        );
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            wire,
            json!({
                "method": "echo",
                "arguments": [{"responseCallback": {"[Function]": 0}}],
                "callbacks": {"0": ["0", "responseCallback"]},
            })
        );
        let back: Message = serde_json::from_value(wire).unwrap();
        assert_eq!(back.function_at(&["0", "responseCallback"]), Some(FunctionRef::new(0)));
    }

    #[test]
    fn call_options_roundtrip() {
        let opts = CallOptions {
            kite: Kite::default(),
            authentication: Some(Authentication::token("abc")),
            with_args: vec![json!("Hello world!")],
            response_callback: Some(FunctionRef::new(0)),
        };
        let v = serde_json::to_value(&opts).unwrap();
        assert_eq!(v["authentication"]["type"], "token");
        assert_eq!(v["withArgs"][0], "Hello world!");
        assert_eq!(v["responseCallback"], json!({"[Function]": 0}));
        let back: CallOptions = serde_json::from_value(v).unwrap();
        assert_eq!(back.with_args, vec![json!("Hello world!")]);
    }
}

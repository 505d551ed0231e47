//! Server-side execution of one incoming method call: options
//! unmarshaling, throttle, the auth gate, the handler chain, and the
//! response callback.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use kite_protocol::{Authentication, CallOptions, FunctionRef, Message, ResponsePayload};

use crate::client::{Client, RemoteFunction};
use crate::error::KiteError;
use crate::method::{Handler, MethodHandling};

/// One in-flight incoming call.
pub struct Request {
    /// Request id, echoed in error payloads.
    pub id: String,
    pub method: String,
    /// The caller's `withArgs`.
    pub args: Vec<Value>,
    /// The calling kite; usable for reverse calls.
    pub client: Client,
    pub auth: Option<Authentication>,
    username: Mutex<String>,
    context: Mutex<HashMap<String, Value>>,
}

impl Request {
    /// The authenticated caller, empty until the auth gate ran.
    pub fn username(&self) -> String {
        self.username.lock().clone()
    }

    pub(crate) fn set_username(&self, username: String) {
        *self.username.lock() = username;
    }

    /// Per-request key/value context shared along the handler chain.
    pub fn context_set(&self, key: &str, value: Value) {
        self.context.lock().insert(key.to_string(), value);
    }

    pub fn context_get(&self, key: &str) -> Option<Value> {
        self.context.lock().get(key).cloned()
    }

    /// Positional argument `i`.
    pub fn arg(&self, i: usize) -> Result<&Value, KiteError> {
        self.args
            .get(i)
            .ok_or_else(|| KiteError::Argument(format!("missing argument {i}")))
    }

    /// Decode positional argument `i`.
    pub fn arg_as<T: DeserializeOwned>(&self, i: usize) -> Result<T, KiteError> {
        serde_json::from_value(self.arg(i)?.clone())
            .map_err(|e| KiteError::Argument(format!("argument {i}: {e}")))
    }

    /// The single argument, decoded.
    pub fn one<T: DeserializeOwned>(&self) -> Result<T, KiteError> {
        self.arg_as(0)
    }

    /// Positional argument `i` as a callable handed over by the
    /// caller.
    pub fn function(&self, i: usize) -> Result<RemoteFunction, KiteError> {
        let func = FunctionRef::from_value(self.arg(i)?)
            .ok_or_else(|| KiteError::Argument(format!("argument {i} is not a function")))?;
        Ok(self.client.bind(func))
    }
}

/// Run one incoming method call to completion, including the response
/// callback invocation.
pub(crate) async fn run_method(client: Client, name: String, msg: Message) {
    let core = client.inner.core.clone();

    let options: Option<CallOptions> = msg
        .arguments
        .first()
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok());

    let response_fn = options
        .as_ref()
        .and_then(|o| o.response_callback)
        .map(|f| client.bind(f));
    let request_id = uuid::Uuid::new_v4().to_string();

    let respond = |outcome: Result<Value, KiteError>| {
        let response_fn = response_fn.clone();
        let request_id = request_id.clone();
        let method = name.clone();
        async move {
            let Some(response_fn) = response_fn else {
                if let Err(e) = outcome {
                    tracing::debug!(method = %method, error = %e, "no response callback for failed call");
                }
                return;
            };
            let payload = match outcome {
                Ok(result) => ResponsePayload::ok(result),
                Err(err) => ResponsePayload::err(err.to_wire(&request_id)),
            };
            let arg = match serde_json::to_value(&payload) {
                Ok(arg) => arg,
                Err(e) => {
                    tracing::error!(method = %method, error = %e, "unserializable response");
                    serde_json::to_value(ResponsePayload::err(
                        KiteError::Generic("unserializable response".into())
                            .to_wire(&request_id),
                    ))
                    .unwrap_or(Value::Null)
                }
            };
            if let Err(e) = response_fn.call(vec![arg]).await {
                tracing::debug!(method = %method, error = %e, "response delivery failed");
            }
        }
    };

    let Some(method) = core.methods.get(&name) else {
        tracing::warn!(method = %name, "method not found");
        respond(Err(KiteError::MethodNotFound(name.clone()))).await;
        return;
    };

    let Some(options) = options else {
        respond(Err(KiteError::Argument(
            "malformed call options".into(),
        )))
        .await;
        return;
    };

    // First contact tells us who the remote side is.
    client.set_remote_kite(options.kite.clone());

    let request = Arc::new(Request {
        id: request_id.clone(),
        method: name.clone(),
        args: options.with_args,
        client: client.clone(),
        auth: options.authentication,
        username: Mutex::new(String::new()),
        context: Mutex::new(HashMap::new()),
    });

    // Throttle before any work.
    if let Some(bucket) = method.bucket() {
        if !bucket.try_take() {
            respond(Err(KiteError::RequestLimit)).await;
            return;
        }
    }

    // Auth gate: a failure short-circuits before the pre chain.
    if method.must_authenticate() && !core.config.disable_authentication {
        match core.authenticate(&request).await {
            Ok(username) => request.set_username(username),
            Err(err) => {
                tracing::debug!(method = %name, error = %err, "authentication failed");
                respond(Err(err)).await;
                return;
            }
        }
    }

    // Compose the chain: global pre + method pre + handler + method
    // post + global post. The handler's own index matters for
    // ReturnError semantics.
    let mut steps: Vec<Arc<dyn Handler>> = Vec::new();
    steps.extend(core.methods.global_pre());
    steps.extend(method.pre_chain());
    let handler_index = steps.len();
    steps.push(method.handler.clone());
    steps.extend(method.post_chain());
    steps.extend(core.methods.global_post());

    let handling = method.handling().unwrap_or(core.methods.default_handling());

    let mut response: Result<Value, KiteError> = Ok(Value::Null);
    let mut first_fixed = false;
    for (i, step) in steps.iter().enumerate() {
        let outcome = run_step(step.as_ref(), request.clone(), &name).await;
        match handling {
            MethodHandling::ReturnLatest => match outcome {
                Ok(v) if !v.is_null() => response = Ok(v),
                Ok(_) => {}
                Err(e) => {
                    response = Err(e);
                    break;
                }
            },
            MethodHandling::ReturnFirst => match outcome {
                Ok(v) if !v.is_null() && !first_fixed => {
                    response = Ok(v);
                    first_fixed = true;
                }
                Ok(_) => {}
                Err(e) if !first_fixed => {
                    response = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::debug!(method = %name, error = %e, "late chain error ignored");
                }
            },
            MethodHandling::ReturnError => match outcome {
                Ok(v) if i == handler_index => response = Ok(v),
                Ok(_) => {}
                Err(e) => {
                    response = Err(e);
                    break;
                }
            },
        }
    }

    // Final functions always run and cannot change the response.
    for step in method.final_chain() {
        if let Err(e) = run_step(step.as_ref(), request.clone(), &name).await {
            tracing::warn!(method = %name, error = %e, "final function failed");
        }
    }

    respond(response).await;
}

/// Run one chain step, converting panics into `genericError`.
async fn run_step(
    step: &dyn Handler,
    request: Arc<Request>,
    method: &str,
) -> Result<Value, KiteError> {
    match std::panic::AssertUnwindSafe(step.handle(request))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            tracing::error!(method = %method, panic = %detail, "handler panicked");
            Err(KiteError::Generic(format!("handler panicked: {detail}")))
        }
    }
}

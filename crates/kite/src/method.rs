//! Method registry: handlers, pre/post/final chains, auth gating, and
//! leaky-bucket throttling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::KiteError;
use crate::request::Request;

/// How a method's handler chain combines step responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodHandling {
    /// Every non-nil step response replaces the previous one; a step
    /// error aborts the remaining steps.
    #[default]
    ReturnLatest,
    /// The first non-nil response wins; later steps still run but
    /// cannot overwrite it.
    ReturnFirst,
    /// Only the main handler's response is kept; chain steps exist for
    /// their side effects and any step error aborts.
    ReturnError,
}

/// A method or chain-step handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Arc<Request>) -> Result<Value, KiteError>;
}

pub(crate) struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Arc<Request>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, KiteError>> + Send,
{
    async fn handle(&self, request: Arc<Request>) -> Result<Value, KiteError> {
        (self.0)(request).await
    }
}

/// Leaky bucket: `capacity` tokens, one token dripped back every
/// `fill_interval`. An empty bucket rejects the call.
pub struct LeakyBucket {
    capacity: f64,
    fill_interval: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_fill: Instant,
}

impl LeakyBucket {
    pub fn new(fill_interval: Duration, capacity: u64) -> Self {
        Self {
            capacity: capacity as f64,
            fill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_fill: Instant::now(),
            }),
        }
    }

    /// Take one token; `false` when the bucket is empty.
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock();
        let elapsed = state.last_fill.elapsed();
        let refill = elapsed.as_secs_f64() / self.fill_interval.as_secs_f64();
        state.tokens = (state.tokens + refill).min(self.capacity);
        state.last_fill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A registered method.
pub struct Method {
    pub name: String,
    pub(crate) handler: Arc<dyn Handler>,
    authenticate: AtomicBool,
    handling: Mutex<Option<MethodHandling>>,
    pre: Mutex<Vec<Arc<dyn Handler>>>,
    post: Mutex<Vec<Arc<dyn Handler>>>,
    finals: Mutex<Vec<Arc<dyn Handler>>>,
    throttle: Mutex<Option<Arc<LeakyBucket>>>,
}

impl Method {
    fn new(name: String, handler: Arc<dyn Handler>) -> Self {
        Self {
            name,
            handler,
            authenticate: AtomicBool::new(true),
            handling: Mutex::new(None),
            pre: Mutex::new(Vec::new()),
            post: Mutex::new(Vec::new()),
            finals: Mutex::new(Vec::new()),
            throttle: Mutex::new(None),
        }
    }

    pub(crate) fn must_authenticate(&self) -> bool {
        self.authenticate.load(Ordering::SeqCst)
    }

    pub(crate) fn handling(&self) -> Option<MethodHandling> {
        *self.handling.lock()
    }

    pub(crate) fn pre_chain(&self) -> Vec<Arc<dyn Handler>> {
        self.pre.lock().clone()
    }

    pub(crate) fn post_chain(&self) -> Vec<Arc<dyn Handler>> {
        self.post.lock().clone()
    }

    pub(crate) fn final_chain(&self) -> Vec<Arc<dyn Handler>> {
        self.finals.lock().clone()
    }

    pub(crate) fn bucket(&self) -> Option<Arc<LeakyBucket>> {
        self.throttle.lock().clone()
    }
}

/// Fluent configuration handle returned by method registration.
#[derive(Clone)]
pub struct MethodHandle {
    method: Arc<Method>,
}

impl MethodHandle {
    /// Let unauthenticated callers invoke this method.
    pub fn disable_authentication(self) -> Self {
        self.method.authenticate.store(false, Ordering::SeqCst);
        self
    }

    /// Override the registry-wide chain semantics for this method.
    pub fn method_handling(self, handling: MethodHandling) -> Self {
        *self.method.handling.lock() = Some(handling);
        self
    }

    /// Rate-limit the method: `capacity` burst tokens, one dripped
    /// back every `fill_interval`.
    pub fn throttle(self, fill_interval: Duration, capacity: u64) -> Self {
        *self.method.throttle.lock() = Some(Arc::new(LeakyBucket::new(fill_interval, capacity)));
        self
    }

    pub fn pre_handle(self, handler: impl Handler + 'static) -> Self {
        self.method.pre.lock().push(Arc::new(handler));
        self
    }

    pub fn pre_handle_func<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, KiteError>> + Send + 'static,
    {
        self.method.pre.lock().push(Arc::new(HandlerFn(f)));
        self
    }

    pub fn post_handle(self, handler: impl Handler + 'static) -> Self {
        self.method.post.lock().push(Arc::new(handler));
        self
    }

    pub fn post_handle_func<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, KiteError>> + Send + 'static,
    {
        self.method.post.lock().push(Arc::new(HandlerFn(f)));
        self
    }

    /// Run unconditionally after the chain, success or error; the
    /// return value is ignored.
    pub fn finally_func<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, KiteError>> + Send + 'static,
    {
        self.method.finals.lock().push(Arc::new(HandlerFn(f)));
        self
    }
}

/// All methods a kite serves, plus the global chains.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<Method>>>,
    pre: RwLock<Vec<Arc<dyn Handler>>>,
    post: RwLock<Vec<Arc<dyn Handler>>>,
    handling: Mutex<MethodHandling>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; panics on duplicate names, which is a
    /// programming error.
    pub fn register(&self, name: &str, handler: Arc<dyn Handler>) -> MethodHandle {
        let method = Arc::new(Method::new(name.to_string(), handler));
        let prev = self
            .methods
            .write()
            .insert(name.to_string(), method.clone());
        assert!(prev.is_none(), "method {name} registered twice");
        MethodHandle { method }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.read().get(name).cloned()
    }

    pub fn pre_handle(&self, handler: Arc<dyn Handler>) {
        self.pre.write().push(handler);
    }

    pub fn post_handle(&self, handler: Arc<dyn Handler>) {
        self.post.write().push(handler);
    }

    pub(crate) fn global_pre(&self) -> Vec<Arc<dyn Handler>> {
        self.pre.read().clone()
    }

    pub(crate) fn global_post(&self) -> Vec<Arc<dyn Handler>> {
        self.post.read().clone()
    }

    pub fn set_method_handling(&self, handling: MethodHandling) {
        *self.handling.lock() = handling;
    }

    pub(crate) fn default_handling(&self) -> MethodHandling {
        *self.handling.lock()
    }
}

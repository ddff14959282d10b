//! Handler registry for dispatching calls by method name.
//!
//! # Example
//!
//! ```
//! use nodelink::handler::{BoxError, HandlerRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("add", |p: Add| async move { Ok::<_, BoxError>(p.a + p.b) });
//!
//! assert!(registry.contains("add"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::JsonCodec;
use crate::protocol::Params;

/// Error returned by a handler. Its `Display` text becomes the RPC error message.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<Value, BoxError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with its raw params.
    fn call(&self, params: Option<Params>) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes params and encodes the result around a typed function.
pub struct TypedHandler<F, T, Fut, R, E>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut, R, E> TypedHandler<F, T, Fut, R, E>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut, R, E> Handler for TypedHandler<F, T, Fut, R, E>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    fn call(&self, params: Option<Params>) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match JsonCodec::from_params(params) {
            Ok(v) => v,
            Err(e) => {
                let error: BoxError = format!("invalid params: {}", e).into();
                return Box::pin(async move { Err(error) });
            }
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            match fut.await {
                Ok(result) => serde_json::to_value(result).map_err(BoxError::from),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Handler that works on params and result values directly.
pub struct RawHandler<F, Fut>
where
    F: Fn(Option<Params>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
}

impl<F, Fut> RawHandler<F, Fut>
where
    F: Fn(Option<Params>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> Handler for RawHandler<F, Fut>
where
    F: Fn(Option<Params>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, params: Option<Params>) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(params))
    }
}

/// Registry mapping method names to handlers.
///
/// Handlers are reference counted so a dispatch can keep running while the
/// entry is replaced or removed.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed method handler, replacing any previous one.
    ///
    /// Params are decoded into `T` (missing params decode from `null`, so
    /// `()` and `Option<_>` accept them). The returned value is encoded as
    /// the call result.
    pub fn register<F, T, Fut, R, E>(&mut self, name: &str, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.insert(name, Arc::new(TypedHandler::new(handler)));
    }

    /// Register a handler over raw params, replacing any previous one.
    pub fn register_raw<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Option<Params>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(name, Arc::new(RawHandler::new(handler)));
    }

    /// Install an already boxed handler.
    pub fn insert(&mut self, name: &str, handler: Arc<dyn Handler>) {
        self.methods.insert(name.to_string(), handler);
    }

    /// Remove a method. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    /// Get a handler by method name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, in no particular order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
